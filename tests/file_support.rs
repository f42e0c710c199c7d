//! Multi-format extraction, end to end through the `crawldex` binary.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn crawldex_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("crawldex");
    path
}

fn ooxml(entries: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, xml) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

fn docx_with_text(phrase: &str) -> Vec<u8> {
    ooxml(&[(
        "word/document.xml",
        format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        ),
    )])
}

fn xlsx_with_cell(text: &str) -> Vec<u8> {
    ooxml(&[
        (
            "xl/sharedStrings.xml",
            format!(
                "<?xml version=\"1.0\"?><sst xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><si><t>{}</t></si></sst>",
                text
            ),
        ),
        (
            "xl/worksheets/sheet1.xml",
            "<?xml version=\"1.0\"?><worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData><row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c></row></sheetData></worksheet>".to_string(),
        ),
    ])
}

fn setup(max_file_bytes: u64) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("files")).unwrap();
    fs::write(root.join("files/readme.txt"), "Plain text file for tests.\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/crawl.sqlite"

[pipeline]
max_file_bytes = {max_file_bytes}

[[roots]]
name = "docs"
path = "{root}/files"
container = "docs"
"#,
        root = root.display(),
    );
    let config_path = root.join("config/crawldex.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_crawldex(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(crawldex_binary())
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run crawldex: {}", e));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn crawl(config_path: &Path) -> String {
    let (stdout, stderr, success) = run_crawldex(config_path, &["crawl", "--wait"]);
    assert!(success, "crawl failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

fn search(config_path: &Path, query: &str) -> String {
    let (stdout, stderr, success) = run_crawldex(config_path, &["search", query, "--root", "docs"]);
    assert!(success, "search failed: {}", stderr);
    stdout
}

#[test]
fn docx_body_is_searchable() {
    let (tmp, config_path) = setup(10 * 1024 * 1024);
    fs::write(tmp.path().join("files/report.docx"), docx_with_text("organoid growth curve")).unwrap();

    crawl(&config_path);
    let out = search(&config_path, "organoid");
    assert!(out.contains("report.docx"), "{}", out);
}

#[test]
fn xlsx_shared_strings_are_searchable() {
    let (tmp, config_path) = setup(10 * 1024 * 1024);
    fs::write(tmp.path().join("files/plates.xlsx"), xlsx_with_cell("cytokine panel")).unwrap();

    crawl(&config_path);
    let out = search(&config_path, "cytokine");
    assert!(out.contains("plates.xlsx"), "{}", out);
}

#[test]
fn html_title_becomes_display_title() {
    let (tmp, config_path) = setup(10 * 1024 * 1024);
    fs::write(
        tmp.path().join("files/index.html"),
        "<html><head><title>Cryostat schedule</title></head><body><p>Book the cryostat here.</p></body></html>",
    )
    .unwrap();

    crawl(&config_path);
    let out = search(&config_path, "cryostat");
    assert!(out.contains("Cryostat schedule"), "{}", out);
}

#[test]
fn quoted_phrase_matches_in_order_only() {
    let (tmp, config_path) = setup(10 * 1024 * 1024);
    fs::write(tmp.path().join("files/a.txt"), "western blot transfer").unwrap();
    fs::write(tmp.path().join("files/b.txt"), "blot western transfer").unwrap();

    crawl(&config_path);
    let out = search(&config_path, "\"western blot\"");
    assert!(out.contains("a.txt"), "{}", out);
    assert!(!out.contains("b.txt"), "{}", out);
}

#[test]
fn broken_document_is_not_retried_on_next_pass() {
    let (tmp, config_path) = setup(10 * 1024 * 1024);
    fs::write(tmp.path().join("files/broken.docx"), b"PK\x03\x04not really a zip").unwrap();

    let first = crawl(&config_path);
    assert!(first.contains("Submitted files: 2"), "{}", first);

    // readme.txt indexed, broken.docx carries a failure marker
    let second = crawl(&config_path);
    assert!(second.contains("Submitted files: 0"), "{}", second);
    let out = search(&config_path, "broken");
    assert!(out.contains("No results."), "{}", out);

    // replacing the file changes its modification time
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(tmp.path().join("files/broken.docx"), docx_with_text("repaired content")).unwrap();
    let (stdout, _, success) =
        run_crawldex(&config_path, &["crawl", "--root", "docs", "--wait"]);
    assert!(success);
    assert!(stdout.contains("Submitted files: 1"), "{}", stdout);
    let out = search(&config_path, "repaired");
    assert!(out.contains("broken.docx"), "{}", out);
}

#[test]
fn oversized_file_is_skipped() {
    let (tmp, config_path) = setup(64);
    let mut body = String::from("centrifuge ");
    body.push_str(&"padding ".repeat(100));
    fs::write(tmp.path().join("files/long.txt"), body).unwrap();
    fs::write(tmp.path().join("files/short.txt"), "centrifuge rotor").unwrap();

    let first = crawl(&config_path);
    assert!(first.contains("Submitted files: 3"), "{}", first);
    let out = search(&config_path, "centrifuge");
    assert!(out.contains("short.txt"), "{}", out);
    assert!(!out.contains("long.txt"), "{}", out);

    let second = crawl(&config_path);
    assert!(second.contains("Submitted files: 0"), "{}", second);
}
