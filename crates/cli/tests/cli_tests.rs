//! End-to-end tests driving the `loxi` binary against the scenarios in
//! spec.md §8, asserting on captured stdout.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

fn loxi_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_loxi"))
}

#[test]
fn runs_a_print_statement() {
    let mut cmd = Command::new(loxi_bin());
    cmd.arg(fixtures_dir().join("hello.lox"));
    cmd.assert().success().stdout(predicate::str::contains("hello, loxi"));
}

#[test]
fn runs_recursive_fibonacci() {
    let mut cmd = Command::new(loxi_bin());
    cmd.arg(fixtures_dir().join("fib.lox"));
    cmd.assert().success().stdout(predicate::str::contains("55"));
}

#[test]
fn arithmetic_precedence_matches_spec_example() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arith.lox");
    std::fs::write(&path, "print 1 + 2 * 3;\n").unwrap();

    let mut cmd = Command::new(loxi_bin());
    cmd.arg(&path);
    cmd.assert().success().stdout(predicate::str::contains("7"));
}

#[test]
fn pow_operator_is_right_associative() {
    // 2 ** 3 ** 2 must parse as 2 ** (3 ** 2) = 2 ** 9 = 512, not
    // (2 ** 3) ** 2 = 64, per spec.md §9's associativity requirement.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pow_assoc.lox");
    std::fs::write(&path, "print 2 ** 3 ** 2;\n").unwrap();

    let mut cmd = Command::new(loxi_bin());
    cmd.arg(&path);
    cmd.assert().success().stdout(predicate::str::contains("512"));
}

#[test]
fn subtraction_is_left_associative() {
    // 10 - 3 - 2 must parse as (10 - 3) - 2 = 5, not 10 - (3 - 2) = 9,
    // contrasting with `**`'s right-associativity above.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sub_assoc.lox");
    std::fs::write(&path, "print 10 - 3 - 2;\n").unwrap();

    let mut cmd = Command::new(loxi_bin());
    cmd.arg(&path);
    cmd.assert().success().stdout(predicate::str::contains("5"));
}

#[test]
fn string_concatenation_matches_spec_example() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concat.lox");
    std::fs::write(&path, r#"let a = "foo"; let b = "bar"; print a + b;"#).unwrap();

    let mut cmd = Command::new(loxi_bin());
    cmd.arg(&path);
    cmd.assert().success().stdout(predicate::str::contains("foobar"));
}

#[test]
fn undefined_variable_is_a_nonzero_exit_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("undef.lox");
    std::fs::write(&path, "print nope;").unwrap();

    let mut cmd = Command::new(loxi_bin());
    cmd.arg(&path);
    cmd.assert()
        .code(70)
        .stderr(predicate::str::contains("Undefined variable"));
}

#[test]
fn compile_error_is_a_distinct_nonzero_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad_syntax.lox");
    std::fs::write(&path, "let = ;").unwrap();

    let mut cmd = Command::new(loxi_bin());
    cmd.arg(&path);
    cmd.assert().code(65);
}

#[test]
fn missing_file_is_reported_as_an_os_error() {
    let mut cmd = Command::new(loxi_bin());
    cmd.arg("/no/such/file.lox");
    cmd.assert().code(74);
}
