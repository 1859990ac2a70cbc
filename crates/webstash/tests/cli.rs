//! CLI surface contract.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_the_session_flags() {
    Command::cargo_bin("webstash")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--input")
                .and(predicate::str::contains("--output"))
                .and(predicate::str::contains("--download"))
                .and(predicate::str::contains("--serve"))
                .and(predicate::str::contains("--archive"))
                .and(predicate::str::contains("--refresh-timeout"))
                .and(predicate::str::contains("--request-timeout"))
                .and(predicate::str::contains("--block-hosts-file"))
                .and(predicate::str::contains("--inject-js-file"))
                .and(predicate::str::contains("--proxy"))
                .and(predicate::str::contains("--allow-lossy-compression"))
                .and(predicate::str::contains("--open-browser")),
        );
}

#[test]
fn no_arguments_is_a_fatal_configuration_error() {
    Command::cargo_bin("webstash")
        .unwrap()
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("FATAL"));
}

#[test]
fn a_missing_input_archive_is_fatal() {
    Command::cargo_bin("webstash")
        .unwrap()
        .args(["-i", "does-not-exist.zip"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("FATAL"));
}

#[test]
fn an_invalid_policy_is_fatal() {
    Command::cargo_bin("webstash")
        .unwrap()
        .args(["-d", "sometimes", "www.a.com"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid download policy"));
}
