//! Integration tests for the JibJab native backend
//!
//! Tests the full pipeline: AST → CodegenSession → MachOBuilder → file, and
//! checks the artifact structure by parsing it back. On Apple Silicon hosts
//! the artifacts are also signed, executed, and compared with the reference
//! interpreter.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use jibjab::arm64::macho::consts;
use jibjab::ast::{BinaryOp, Expr, InterpolationPart, LoopRange, LoopStmt, Program, Stmt};
use jibjab::interpreter::interpret;
use jibjab::{compile, compile_to_file, JibJabError};

// ============================================================================
// Programs
// ============================================================================

fn sum_program() -> Program {
    Program::new(vec![
        Stmt::decl("x", Expr::int(10)),
        Stmt::decl("y", Expr::binary(BinaryOp::Add, Expr::var("x"), Expr::int(5))),
        Stmt::print(Expr::var("y")),
    ])
}

fn fibonacci_program() -> Program {
    let minus = |n| Expr::binary(BinaryOp::Sub, Expr::var("n"), Expr::int(n));
    Program::new(vec![
        Stmt::func(
            "fib",
            &["n"],
            vec![
                Stmt::if_else(
                    Expr::binary(BinaryOp::Le, Expr::var("n"), Expr::int(1)),
                    vec![Stmt::Return(Expr::var("n"))],
                    None,
                ),
                Stmt::Return(Expr::binary(
                    BinaryOp::Add,
                    Expr::call("fib", vec![minus(1)]),
                    Expr::call("fib", vec![minus(2)]),
                )),
            ],
        ),
        Stmt::counted_loop(
            "i",
            Expr::int(0),
            Expr::int(15),
            vec![Stmt::print(Expr::call("fib", vec![Expr::var("i")]))],
        ),
    ])
}

fn enum_program() -> Program {
    Program::new(vec![
        Stmt::enum_def("Letter", &["A", "B", "C"]),
        Stmt::decl("l", Expr::index(Expr::var("Letter"), Expr::str("B"))),
        Stmt::print(Expr::var("l")),
    ])
}

fn collection_loop_program() -> Program {
    Program::new(vec![
        Stmt::decl("xs", Expr::Array(vec![Expr::int(1), Expr::int(2)])),
        Stmt::Loop(LoopStmt {
            var: "x".into(),
            range: LoopRange::Collection(Expr::var("xs")),
            body: vec![Stmt::print(Expr::var("x"))],
        }),
    ])
}

fn composites_program() -> Program {
    Program::new(vec![
        Stmt::decl("empty", Expr::Array(vec![])),
        Stmt::print(Expr::var("empty")),
        Stmt::decl("xs", Expr::Array(vec![Expr::int(3), Expr::int(1), Expr::int(2)])),
        Stmt::print(Expr::var("xs")),
        Stmt::decl(
            "grid",
            Expr::Array(vec![
                Expr::Array(vec![Expr::int(1), Expr::int(2)]),
                Expr::Array(vec![Expr::int(3), Expr::int(4)]),
            ]),
        ),
        Stmt::print(Expr::var("grid")),
        Stmt::print(Expr::index(Expr::var("grid"), Expr::int(1))),
        Stmt::print(Expr::index(Expr::index(Expr::var("grid"), Expr::int(1)), Expr::int(0))),
        Stmt::decl(
            "t",
            Expr::Tuple(vec![Expr::int(1), Expr::str("a"), Expr::float(2.5)]),
        ),
        Stmt::print(Expr::var("t")),
        Stmt::decl(
            "d",
            Expr::dict(vec![
                (Expr::str("name"), Expr::str("jj")),
                (Expr::str("xs"), Expr::Array(vec![Expr::int(1), Expr::int(2)])),
            ]),
        ),
        Stmt::print(Expr::var("d")),
        Stmt::print(Expr::index(Expr::var("d"), Expr::str("name"))),
        Stmt::counted_loop(
            "i",
            Expr::int(0),
            Expr::int(3),
            vec![Stmt::print(Expr::index(Expr::var("xs"), Expr::var("i")))],
        ),
        Stmt::decl("one", Expr::Array(vec![Expr::int(42)])),
        Stmt::print(Expr::var("one")),
        Stmt::decl("fs", Expr::Array(vec![Expr::float(1.5), Expr::float(-0.25)])),
        Stmt::print(Expr::var("fs")),
        Stmt::enum_def("Color", &["Red", "Green", "Blue"]),
        Stmt::print(Expr::var("Color")),
        Stmt::decl("c", Expr::index(Expr::var("Color"), Expr::str("Blue"))),
        Stmt::print(Expr::var("c")),
        Stmt::counted_loop(
            "i",
            Expr::int(0),
            Expr::int(2),
            vec![Stmt::print(Expr::index(Expr::var("grid"), Expr::var("i")))],
        ),
    ])
}

/// Counted loops and if/else alternating `depth` levels deep
fn nested_program(depth: usize) -> Vec<Stmt> {
    if depth == 0 {
        return vec![Stmt::print(Expr::binary(
            BinaryOp::Add,
            Expr::var("i1"),
            Expr::var("i2"),
        ))];
    }
    let counter = format!("i{}", depth);
    let odd = Expr::binary(
        BinaryOp::Ne,
        Expr::binary(BinaryOp::Mod, Expr::var(counter.as_str()), Expr::int(2)),
        Expr::int(0),
    );
    vec![Stmt::counted_loop(
        counter.as_str(),
        Expr::int(0),
        Expr::int(2),
        vec![Stmt::if_else(
            odd,
            nested_program(depth - 1),
            Some(vec![Stmt::print(Expr::int(depth as i64 * 10))]),
        )],
    )]
}

fn arithmetic_program() -> Program {
    let print = |op, a, b| Stmt::print(Expr::binary(op, a, b));
    Program::new(vec![
        print(BinaryOp::Div, Expr::int(7), Expr::int(2)),
        print(BinaryOp::Mod, Expr::int(-7), Expr::int(3)),
        print(BinaryOp::Div, Expr::int(7), Expr::int(0)),
        print(BinaryOp::Mod, Expr::int(7), Expr::int(0)),
        print(BinaryOp::Mul, Expr::float(1.5), Expr::int(3)),
        print(BinaryOp::Mod, Expr::float(7.5), Expr::float(2.0)),
        print(BinaryOp::Div, Expr::float(1.0), Expr::float(3.0)),
        print(BinaryOp::Lt, Expr::float(1.5), Expr::int(2)),
        print(BinaryOp::Eq, Expr::str("a"), Expr::str("a")),
        print(BinaryOp::And, Expr::Bool(true), Expr::int(0)),
        Stmt::decl("n", Expr::int(4)),
        Stmt::print(Expr::Interpolation(vec![
            InterpolationPart::Text("n is ".into()),
            InterpolationPart::Var("n".into()),
            InterpolationPart::Text(" (100%)".into()),
        ])),
    ])
}

// ============================================================================
// Mach-O parsing helpers
// ============================================================================

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn name_at(buf: &[u8], at: usize) -> String {
    let raw = &buf[at..at + 16];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[derive(Debug)]
struct Segment {
    name: String,
    vmaddr: u64,
    fileoff: u64,
    filesize: u64,
    sections: Vec<(String, u64, u64)>,
}

/// Walk the load commands: (cmd, offset) pairs and the parsed segments
fn load_commands(buf: &[u8]) -> (Vec<(u32, usize)>, Vec<Segment>) {
    let ncmds = u32_at(buf, 16) as usize;
    let mut at = 32;
    let mut commands = Vec::new();
    let mut segments = Vec::new();
    for _ in 0..ncmds {
        let cmd = u32_at(buf, at);
        let size = u32_at(buf, at + 4) as usize;
        commands.push((cmd, at));
        if cmd == consts::LC_SEGMENT_64 {
            let nsects = u32_at(buf, at + 64) as usize;
            let sections = (0..nsects)
                .map(|i| {
                    let s = at + 72 + i * 80;
                    (name_at(buf, s), u64_at(buf, s + 32), u32_at(buf, s + 48) as u64)
                })
                .collect();
            segments.push(Segment {
                name: name_at(buf, at + 8),
                vmaddr: u64_at(buf, at + 24),
                fileoff: u64_at(buf, at + 40),
                filesize: u64_at(buf, at + 48),
                sections,
            });
        }
        at += size;
    }
    (commands, segments)
}

/// File offset and size of `__TEXT,__text`
fn text_section(buf: &[u8]) -> (usize, usize) {
    let ncmds = u32_at(buf, 16) as usize;
    let mut at = 32;
    for _ in 0..ncmds {
        if u32_at(buf, at) == consts::LC_SEGMENT_64 && name_at(buf, at + 8) == "__TEXT" {
            let s = at + 72;
            assert_eq!(name_at(buf, s), "__text");
            return (u32_at(buf, s + 48) as usize, u64_at(buf, s + 40) as usize);
        }
        at += u32_at(buf, at + 4) as usize;
    }
    panic!("no __text section");
}

/// The instruction words of `__text`
fn text_words(buf: &[u8]) -> Vec<u32> {
    let (offset, size) = text_section(buf);
    buf[offset..offset + size]
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
        .collect()
}

fn contains_run(words: &[u32], run: &[u32]) -> bool {
    words.windows(run.len()).any(|w| w == run)
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("jibjab-it-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

// ============================================================================
// Artifact structure
// ============================================================================

#[test]
fn test_header_and_load_commands() {
    let bytes = compile(&sum_program()).unwrap();
    assert_eq!(u32_at(&bytes, 0), consts::MH_MAGIC_64);
    assert_eq!(u32_at(&bytes, 4) as i32, consts::CPU_TYPE_ARM64);
    assert_eq!(u32_at(&bytes, 12), consts::MH_EXECUTE);

    let (commands, segments) = load_commands(&bytes);
    assert_eq!(commands.len(), 12);
    let kinds: Vec<u32> = commands.iter().map(|(cmd, _)| *cmd).collect();
    for expected in [
        consts::LC_DYLD_CHAINED_FIXUPS,
        consts::LC_DYLD_EXPORTS_TRIE,
        consts::LC_SYMTAB,
        consts::LC_DYSYMTAB,
        consts::LC_LOAD_DYLINKER,
        consts::LC_BUILD_VERSION,
        consts::LC_MAIN,
        consts::LC_LOAD_DYLIB,
    ] {
        assert!(kinds.contains(&expected), "missing load command {:#x}", expected);
    }

    let names: Vec<&str> = segments.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["__PAGEZERO", "__TEXT", "__DATA_CONST", "__LINKEDIT"]);
    assert_eq!(segments[1].vmaddr, consts::IMAGE_BASE);
    assert_eq!(segments[1].fileoff, 0);
}

#[test]
fn test_segments_tile_the_file() {
    let bytes = compile(&composites_program()).unwrap();
    let (_, segments) = load_commands(&bytes);
    let text = &segments[1];
    let data_const = &segments[2];
    let linkedit = &segments[3];

    assert_eq!(text.filesize % consts::PAGE_SIZE, 0);
    assert_eq!(data_const.fileoff, text.fileoff + text.filesize);
    assert_eq!(linkedit.fileoff, data_const.fileoff + data_const.filesize);
    assert_eq!(linkedit.fileoff + linkedit.filesize, bytes.len() as u64);

    // Every section's file offset matches its address
    for segment in &segments[1..3] {
        for (name, addr, offset) in &segment.sections {
            assert_eq!(
                addr - segment.vmaddr,
                offset - segment.fileoff,
                "section {} misplaced",
                name
            );
        }
    }
    let sections: Vec<&str> = text.sections.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(sections, ["__text", "__cstring", "__const"]);
    assert_eq!(data_const.sections[0].0, "__got");
}

#[test]
fn test_entry_point_is_in_text() {
    let bytes = compile(&fibonacci_program()).unwrap();
    let (commands, segments) = load_commands(&bytes);
    let (_, main_at) = commands
        .iter()
        .find(|(cmd, _)| *cmd == consts::LC_MAIN)
        .copied()
        .unwrap();
    let entryoff = u64_at(&bytes, main_at + 8);

    let (_, text_addr, text_offset) = segments[1].sections[0].clone();
    assert_eq!(text_offset, consts::PAGE_SIZE);
    assert_eq!(text_addr, consts::IMAGE_BASE + consts::PAGE_SIZE);
    // fib comes first, so main is not at the start of the code
    assert!(entryoff > text_offset);
    assert_eq!(entryoff % 4, 0);
}

#[test]
fn test_chained_fixups_name_both_imports() {
    let bytes = compile(&sum_program()).unwrap();
    let (commands, _) = load_commands(&bytes);
    let (_, at) = commands
        .iter()
        .find(|(cmd, _)| *cmd == consts::LC_DYLD_CHAINED_FIXUPS)
        .copied()
        .unwrap();
    let dataoff = u32_at(&bytes, at + 8) as usize;
    let datasize = u32_at(&bytes, at + 12) as usize;
    let blob = &bytes[dataoff..dataoff + datasize];

    assert_eq!(u32_at(blob, 0), 0); // fixups_version
    assert_eq!(u32_at(blob, 16), 2); // imports_count
    assert_eq!(u32_at(blob, 20), consts::DYLD_CHAINED_IMPORT);
    let symbols_offset = u32_at(blob, 12) as usize;
    let pool = &blob[symbols_offset..];
    assert!(pool.starts_with(b"_printf\0_exit\0"));
}

// ============================================================================
// Instruction stream
// ============================================================================

#[test]
fn test_recursive_calls_branch_to_the_function() {
    let words = text_words(&compile(&fibonacci_program()).unwrap());
    // fib is emitted first, at the start of __text
    let calls: Vec<i64> = words
        .iter()
        .enumerate()
        .filter(|(_, &w)| w & 0xFC00_0000 == 0x9400_0000)
        .map(|(i, &w)| {
            let imm26 = ((w & 0x03FF_FFFF) << 6) as i32 >> 6;
            i as i64 * 4 + imm26 as i64 * 4
        })
        .collect();
    // two recursive calls and one from the loop in main
    assert_eq!(calls, [0, 0, 0]);
}

#[test]
fn test_remainder_sequences() {
    let words = text_words(&compile(&arithmetic_program()).unwrap());
    // sdiv x2, x0, x1; msub x0, x2, x1, x0
    assert!(contains_run(&words, &[0x9AC1_0C02, 0x9B01_8040]));
    // fdiv d2, d0, d1; frintz d2, d2; fmsub d0, d2, d1, d0
    assert!(contains_run(&words, &[0x1E61_1802, 0x1E65_C042, 0x1F41_8040]));
}

#[test]
fn test_imports_are_called_through_the_got() {
    let words = text_words(&compile(&sum_program()).unwrap());
    let blr_x16 = 0xD63F_0200;
    let calls: Vec<usize> = (0..words.len()).filter(|&i| words[i] == blr_x16).collect();
    assert_eq!(calls.len(), 2);
    for &i in &calls {
        // adrp x16, page; ldr x16, [x16, #off]; blr x16
        assert_eq!(words[i - 2] & 0x9F00_001F, 0x9000_0010);
        assert_eq!(words[i - 1] & 0xFFC0_03FF, 0xF940_0210);
    }
    // printf is GOT slot 0
    assert_eq!(words[calls[0] - 1], 0xF940_0210);
    // exit(0): mov x0, xzr, then GOT slot 1
    let exit = calls[1];
    assert_eq!(words[exit - 3], 0xAA1F_03E0);
    assert_eq!(words[exit - 1], 0xF940_0610);
}

#[test]
fn test_deeply_nested_control_flow_compiles() {
    let program = Program::new(nested_program(6));
    let bytes = compile(&program).unwrap();
    let words = text_words(&bytes);
    // Every branch was patched away from its zero placeholder
    let unpatched = words
        .iter()
        .filter(|&&w| {
            let b = w == 0x1400_0000;
            let b_cond = w & 0xFF00_0010 == 0x5400_0000 && w & 0x00FF_FFE0 == 0;
            let cbz = w & 0x7E00_0000 == 0x3400_0000 && w & 0x00FF_FFE0 == 0;
            b || b_cond || cbz
        })
        .count();
    assert_eq!(unpatched, 0);
    // The even iteration of each level prints, the odd one descends
    assert_eq!(interpret(&program).unwrap(), "60\n50\n40\n30\n20\n10\n2\n");
}

#[test]
fn test_compilation_is_deterministic() {
    for program in [sum_program(), fibonacci_program(), composites_program(), arithmetic_program()] {
        assert_eq!(compile(&program).unwrap(), compile(&program).unwrap());
    }
}

#[test]
fn test_json_input_compiles_like_built_ast() {
    let json = r#"{"statements": [
        {"var_decl": {"name": "x", "value": {"int": 10}}},
        {"var_decl": {"name": "y", "value": {"binary": {"op": "add", "lhs": {"var": "x"}, "rhs": {"int": 5}}}}},
        {"print": {"var": "y"}}
    ]}"#;
    let program = Program::from_json(json).unwrap();
    assert_eq!(program, sum_program());
    assert_eq!(compile(&program).unwrap(), compile(&sum_program()).unwrap());
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_sum() {
    assert_eq!(interpret(&sum_program()).unwrap(), "15\n");
    assert!(compile(&sum_program()).is_ok());
}

#[test]
fn test_scenario_fibonacci() {
    let expected: String = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377]
        .iter()
        .map(|n| format!("{}\n", n))
        .collect();
    assert_eq!(interpret(&fibonacci_program()).unwrap(), expected);
    assert!(compile(&fibonacci_program()).is_ok());
}

#[test]
fn test_scenario_enum_case() {
    assert_eq!(interpret(&enum_program()).unwrap(), "B\n");
    assert!(compile(&enum_program()).is_ok());
}

#[test]
fn test_scenario_collection_loop_rejected() {
    let dir = scratch_dir("reject");
    let out = dir.join("prog");
    let err = compile_to_file(&collection_loop_program(), &out).unwrap_err();
    match err {
        JibJabError::UnsupportedConstruct { construct } => assert_eq!(construct, "collection loop"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!out.exists());
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_composites_interpreted() {
    let expected = "[]\n[3, 1, 2]\n[[1, 2], [3, 4]]\n[3, 4]\n3\n(1, \"a\", 2.5)\n\
                    {\"name\": \"jj\", \"xs\": [1, 2]}\njj\n3\n1\n2\n\
                    [42]\n[1.5, -0.25]\n{\"Red\": Red, \"Green\": Green, \"Blue\": Blue}\nBlue\n\
                    [1, 2]\n[3, 4]\n";
    assert_eq!(interpret(&composites_program()).unwrap(), expected);
}

#[test]
fn test_arithmetic_interpreted() {
    let expected = "3\n-1\n0\n7\n4.5\n1.5\n0.333333\ntrue\ntrue\nfalse\nn is 4 (100%)\n";
    assert_eq!(interpret(&arithmetic_program()).unwrap(), expected);
}

#[test]
fn test_unsupported_constructs() {
    let cases = [
        (
            Program::new(vec![Stmt::Try {
                body: vec![],
                handler: vec![],
            }]),
            "try",
        ),
        (
            Program::new(vec![Stmt::print(Expr::Input(Box::new(Expr::str("? "))))]),
            "input",
        ),
        (
            Program::new(vec![Stmt::Loop(LoopStmt {
                var: "_".into(),
                range: LoopRange::Condition(Expr::Bool(true)),
                body: vec![],
            })]),
            "condition loop",
        ),
    ];
    for (program, expected) in cases {
        match compile(&program) {
            Err(JibJabError::UnsupportedConstruct { construct }) => {
                assert!(construct.contains(expected), "{} vs {}", construct, expected)
            }
            other => panic!("expected rejection of {}, got {:?}", expected, other.map(|b| b.len())),
        }
    }
}

// ============================================================================
// CLI
// ============================================================================

fn jjc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_jjc"))
}

#[test]
fn test_cli_run_and_check() {
    let dir = scratch_dir("cli");
    let ast = dir.join("sum.json");
    fs::write(&ast, sum_program().to_json().unwrap()).unwrap();

    let run = jjc().arg("run").arg(&ast).output().unwrap();
    assert!(run.status.success());
    assert_eq!(String::from_utf8_lossy(&run.stdout), "15\n");

    let check = jjc().arg("check").arg(&ast).output().unwrap();
    assert!(check.status.success());
    // check never writes the artifact
    assert!(!dir.join("sum").exists());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_cli_build_failure_leaves_no_artifact() {
    let dir = scratch_dir("cli-fail");
    let ast = dir.join("loop.json");
    fs::write(&ast, collection_loop_program().to_json().unwrap()).unwrap();

    let build = jjc().arg("build").arg(&ast).output().unwrap();
    assert!(!build.status.success());
    assert!(String::from_utf8_lossy(&build.stderr).contains("collection loop"));
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_cli_build_default_output() {
    let dir = scratch_dir("cli-build");
    let ast = dir.join("sum.json");
    fs::write(&ast, sum_program().to_json().unwrap()).unwrap();

    let build = jjc().arg("build").arg(&ast).output().unwrap();
    assert!(build.status.success());
    let artifact = fs::read(dir.join("sum")).unwrap();
    assert_eq!(artifact, compile(&sum_program()).unwrap());

    fs::remove_dir_all(&dir).unwrap();
}

// ============================================================================
// Native execution (Apple Silicon only)
// ============================================================================

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod native {
    use super::*;

    fn run_native(name: &str, program: &Program) -> String {
        let dir = scratch_dir(&format!("native-{}", name));
        let exe = dir.join(name);
        compile_to_file(program, &exe).unwrap();
        let signed = Command::new("codesign")
            .args(["-s", "-", "-f"])
            .arg(&exe)
            .status()
            .unwrap();
        assert!(signed.success());

        let output = Command::new(&exe).output().unwrap();
        assert!(output.status.success(), "{} exited with {}", name, output.status);
        fs::remove_dir_all(&dir).unwrap();
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn assert_equivalent(name: &str, program: Program) {
        let expected = interpret(&program).unwrap();
        assert_eq!(run_native(name, &program), expected, "{} diverged", name);
    }

    #[test]
    fn test_native_sum() {
        assert_eq!(run_native("sum", &sum_program()), "15\n");
    }

    #[test]
    fn test_native_matches_interpreter() {
        assert_equivalent("fib", fibonacci_program());
        assert_equivalent("enum", enum_program());
        assert_equivalent("composites", composites_program());
        assert_equivalent("arithmetic", arithmetic_program());
        assert_equivalent("nested", Program::new(nested_program(6)));
    }
}
