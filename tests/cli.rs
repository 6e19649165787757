use assert_cmd::Command;
use std::fs::{self, File};
use std::io::Write;
use tempfile::TempDir;

fn polyglot_tts() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("polyglot-tts").unwrap()
}

fn npy_vector(values: &[f32]) -> Vec<u8> {
    let header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({},), }}\n",
        values.len()
    );
    let mut out = b"\x93NUMPY\x01\x00".to_vec();
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Lays out a model directory with the given speakers and a model file that
/// is not a valid ONNX graph.
fn model_dir(speakers: &[&str], languages: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let config = serde_json::json!({
        "type": "ONNX1",
        "model_file": "model.onnx",
        "speakers": "speakers.npz",
        "languages": languages,
    });
    fs::write(dir.path().join("config.json"), config.to_string()).unwrap();
    fs::write(dir.path().join("model.onnx"), b"not an onnx graph").unwrap();

    let mut archive = zip::ZipWriter::new(File::create(dir.path().join("speakers.npz")).unwrap());
    archive
        .start_file("README.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    archive.write_all(b"speaker embeddings").unwrap();
    for speaker in speakers {
        archive
            .start_file(
                format!("{speaker}.npy"),
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
        archive.write_all(&npy_vector(&[0.1, 0.2, 0.3])).unwrap();
    }
    archive.finish().unwrap();
    dir
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_cli_help() {
    polyglot_tts().arg("--help").assert().success();
}

#[test]
fn test_no_arguments_prints_usage() {
    let output = polyglot_tts().assert().code(1).get_output().clone();
    assert!(stdout_of(&output).contains("Usage: polyglot-tts <text> <output_path> <language_code>"));
}

#[test]
fn test_two_arguments_prints_usage() {
    let output = polyglot_tts()
        .args(["Hello World", "out.wav"])
        .assert()
        .code(1)
        .get_output()
        .clone();
    assert!(stdout_of(&output).contains("Usage:"));
}

#[test]
fn test_extra_argument_prints_usage() {
    let output = polyglot_tts()
        .args(["Hello World", "out.wav", "en", "surplus"])
        .assert()
        .code(1)
        .get_output()
        .clone();
    assert!(stdout_of(&output).contains("Usage:"));
}

#[test]
fn test_missing_model_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output_file = dir.path().join("out.wav");

    let output = polyglot_tts()
        .arg("Hello World")
        .arg(&output_file)
        .arg("en")
        .arg("--model-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .get_output()
        .clone();

    assert!(stdout_of(&output).contains("Loading TTS model"));
    let stderr = stderr_of(&output);
    assert!(stderr.contains("Error:"));
    assert!(stderr.contains("config.json"));
    assert!(!output_file.exists());
}

#[test]
fn test_error_output_carries_stack_trace() {
    let dir = tempfile::tempdir().unwrap();

    let output = polyglot_tts()
        .env_remove("RUST_BACKTRACE")
        .env_remove("RUST_LIB_BACKTRACE")
        .arg("Hello World")
        .arg(dir.path().join("out.wav"))
        .arg("en")
        .arg("--model-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .get_output()
        .clone();

    let stderr = stderr_of(&output);
    let error_at = stderr.find("Error:").unwrap();
    let trace_at = stderr.find("Stack backtrace:").unwrap();
    assert!(error_at < trace_at);
    assert!(stderr[trace_at..].lines().count() > 1);
}

#[test]
fn test_hyphen_led_text_reaches_model_loading() {
    let dir = tempfile::tempdir().unwrap();

    let output = polyglot_tts()
        .arg("-5 degrees outside")
        .arg(dir.path().join("out.wav"))
        .arg("en")
        .arg("--model-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .get_output()
        .clone();

    let stdout = stdout_of(&output);
    assert!(stdout.contains("Loading TTS model"));
    assert!(!stdout.contains("Usage:"));
}

#[test]
fn test_unsupported_language_warns_and_still_loads_model() {
    let dir = tempfile::tempdir().unwrap();
    let output_file = dir.path().join("out.wav");

    let output = polyglot_tts()
        .arg("Hallo")
        .arg(&output_file)
        .arg("XX")
        .arg("--model-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .get_output()
        .clone();

    let stdout = stdout_of(&output);
    assert!(stdout.contains("Warning: Language code 'xx' might not be supported"));
    assert!(stdout.contains("Loading TTS model"));
}

#[test]
fn test_supported_language_has_no_warning() {
    let dir = tempfile::tempdir().unwrap();

    let output = polyglot_tts()
        .arg("Hola")
        .arg(dir.path().join("out.wav"))
        .arg("ES")
        .arg("--model-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .get_output()
        .clone();

    assert!(!stdout_of(&output).contains("Warning"));
}

#[test]
fn test_empty_speaker_table_fails() {
    let model = model_dir(&[], &[]);
    let output_file = model.path().join("out.wav");

    let output = polyglot_tts()
        .arg("Hello World")
        .arg(&output_file)
        .arg("en")
        .arg("--model-dir")
        .arg(model.path())
        .assert()
        .code(1)
        .get_output()
        .clone();

    assert!(stdout_of(&output).contains("Info: The model does not declare its supported languages."));
    assert!(stderr_of(&output).contains("Error: No speakers found in the loaded model."));
    assert!(!output_file.exists());
}

#[test]
fn test_unknown_speaker_fails() {
    let model = model_dir(&["Henriette Usha", "Ana Florence"], &[]);
    let output_file = model.path().join("out.wav");

    let output = polyglot_tts()
        .arg("Hello World")
        .arg(&output_file)
        .arg("en")
        .arg("--model-dir")
        .arg(model.path())
        .arg("--speaker")
        .arg("Nobody")
        .assert()
        .code(1)
        .get_output()
        .clone();

    assert!(stdout_of(&output).contains(r#"Available speaker IDs: ["Ana Florence", "Henriette Usha"]"#));
    assert!(stderr_of(&output).contains("speaker 'Nobody' is not available"));
    assert!(!output_file.exists());
}

#[test]
fn test_missing_default_speaker_warns_on_stdout() {
    let model = model_dir(&["Ana Florence"], &[]);

    let output = polyglot_tts()
        .arg("Hello World")
        .arg(model.path().join("out.wav"))
        .arg("en")
        .arg("--model-dir")
        .arg(model.path())
        .arg("--ort-lib")
        .arg(model.path().join("libonnxruntime-missing.so"))
        .assert()
        .code(1)
        .get_output()
        .clone();

    assert!(stdout_of(&output).contains(
        "Warning: Default speaker 'Henriette Usha' not found in the model, using 'Ana Florence'"
    ));
    assert!(!stderr_of(&output).contains("Warning:"));
}

#[test]
fn test_language_outside_model_declaration_fails() {
    let model = model_dir(&["Henriette Usha"], &["en", "de"]);
    let output_file = model.path().join("out.wav");

    let output = polyglot_tts()
        .arg("Bonjour")
        .arg(&output_file)
        .arg("fr")
        .arg("--model-dir")
        .arg(model.path())
        .assert()
        .code(1)
        .get_output()
        .clone();

    assert!(stdout_of(&output).contains(r#"Available languages: ["en", "de"]"#));
    assert!(stderr_of(&output).contains("language 'fr' is not supported by model"));
    assert!(!output_file.exists());
}

#[test]
fn test_broken_model_fails_without_output_file() {
    let model = model_dir(&["Henriette Usha"], &[]);
    let output_file = model.path().join("out.wav");

    let output = polyglot_tts()
        .arg("Hello World")
        .arg(&output_file)
        .arg("en")
        .arg("--model-dir")
        .arg(model.path())
        .arg("--ort-lib")
        .arg(model.path().join("libonnxruntime-missing.so"))
        .assert()
        .code(1)
        .get_output()
        .clone();

    assert!(stdout_of(&output).contains("Available speaker IDs"));
    assert!(stderr_of(&output).contains("Error:"));
    assert!(!output_file.exists());
}

#[test]
fn test_repo_id_conflicts_with_model_dir() {
    let dir = tempfile::tempdir().unwrap();
    let output = polyglot_tts()
        .arg("Hello World")
        .arg(dir.path().join("out.wav"))
        .arg("en")
        .arg("--model-dir")
        .arg(dir.path())
        .arg("--repo-id")
        .arg("someone/model")
        .assert()
        .code(1)
        .get_output()
        .clone();
    assert!(stdout_of(&output).contains("Usage:"));
}
