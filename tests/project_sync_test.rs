//! Project sync end-to-end: hash diff uploads, the in-sync fast path, and
//! whole-filesystem downloads.

mod common;

use std::fs;
use std::path::Path;

use common::{assert_no_request, connect};
use mpy_session::ProjectSyncOptions;
use serde_json::json;

fn write_project(root: &Path) {
    fs::create_dir_all(root.join("lib")).unwrap();
    fs::write(root.join("main.py"), b"print('hello')").unwrap();
    fs::write(root.join("lib/util.py"), b"x = 1").unwrap();
}

#[tokio::test]
async fn upload_project_transfers_only_the_diff() {
    let (session, mut helper, _spawned) = connect().await;
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());

    let call = {
        let session = session.clone();
        let root = dir.path().to_path_buf();
        tokio::spawn(async move {
            session
                .upload_project(&root, &ProjectSyncOptions::default(), None)
                .await
        })
    };

    // Step 1: the device is asked for hashes of every scanned path, in
    // sorted relative order.
    let request = helper.expect_request().await;
    assert_eq!(request["command"], "calc_file_hashes");
    assert_eq!(request["args"]["files"], json!(["lib/util.py", "main.py"]));

    // The device agrees on lib/util.py but differs on main.py.
    let util_hash = sha256_hex(b"x = 1");
    helper
        .emit_stdout(&format!(
            "{{\"file\": \"lib/util.py\", \"hash\": \"{util_hash}\"}}\n{{\"file\": \"main.py\", \"hash\": \"0000\"}}\n!!EOO!!\n"
        ))
        .await;

    // Step 2: only the differing file is uploaded, rooted at the project.
    let request = helper.expect_request().await;
    assert_eq!(request["command"], "upload_files");
    let expected_file = dir.path().join("main.py").to_string_lossy().into_owned();
    assert_eq!(request["args"]["files"], json!([expected_file]));
    assert_eq!(request["args"]["remote"], ":");
    assert_eq!(
        request["args"]["local_base_dir"],
        dir.path().to_string_lossy().into_owned()
    );
    helper.emit_stdout("!!EOO!!\n").await;

    let status = call.await.unwrap().expect("upload status");
    assert!(status.ok);
}

#[tokio::test]
async fn upload_project_in_sync_resolves_none() {
    let (session, mut helper, _spawned) = connect().await;
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());

    let call = {
        let session = session.clone();
        let root = dir.path().to_path_buf();
        tokio::spawn(async move {
            session
                .upload_project(&root, &ProjectSyncOptions::default(), None)
                .await
        })
    };

    helper.expect_request().await;
    let main_hash = sha256_hex(b"print('hello')");
    let util_hash = sha256_hex(b"x = 1");
    helper
        .emit_stdout(&format!(
            "{{\"file\": \"lib/util.py\", \"hash\": \"{util_hash}\"}}\n{{\"file\": \"main.py\", \"hash\": \"{main_hash}\"}}\n!!EOO!!\n"
        ))
        .await;

    assert_eq!(call.await.unwrap(), None);
    // No upload request follows when everything matched.
    assert_no_request(&mut helper).await;
}

#[tokio::test]
async fn download_project_single_file_targets_literally() {
    let (session, mut helper, _spawned) = connect().await;
    let dir = tempfile::tempdir().unwrap();

    let call = {
        let session = session.clone();
        let dest = dir.path().to_path_buf();
        tokio::spawn(async move { session.download_project(&dest, None).await })
    };

    let request = helper.expect_request().await;
    assert_eq!(request["command"], "list_contents_recursive");
    assert_eq!(request["args"]["target"], "/");
    helper.emit_stdout("  14 /main.py\n!!EOO!!\n").await;

    // The helper treats a single-file local target literally, so the remote
    // file name is appended to the destination.
    let request = helper.expect_request().await;
    assert_eq!(request["command"], "download_files");
    assert_eq!(request["args"]["files"], json!(["/main.py"]));
    let expected_local = format!("{}/main.py", dir.path().to_string_lossy());
    assert_eq!(request["args"]["local"], expected_local);
    helper.emit_stdout("!!EOO!!\n").await;

    assert!(call.await.unwrap().expect("download status").ok);
}

#[tokio::test]
async fn download_project_many_files_target_directory() {
    let (session, mut helper, _spawned) = connect().await;
    let dir = tempfile::tempdir().unwrap();

    let call = {
        let session = session.clone();
        let dest = dir.path().to_path_buf();
        tokio::spawn(async move { session.download_project(&dest, None).await })
    };

    helper.expect_request().await;
    helper
        .emit_stdout("  14 /main.py\n   0 /lib/\n   5 /lib/util.py\n!!EOO!!\n")
        .await;

    let request = helper.expect_request().await;
    assert_eq!(request["command"], "download_files");
    // Directories are not downloadable; only the files are requested.
    assert_eq!(
        request["args"]["files"],
        json!(["/main.py", "/lib/util.py"])
    );
    assert_eq!(
        request["args"]["local"],
        dir.path().to_string_lossy().into_owned()
    );
    helper.emit_stdout("!!EOO!!\n").await;

    assert!(call.await.unwrap().expect("download status").ok);
}

fn sha256_hex(contents: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(contents);
    format!("{:x}", hasher.finalize())
}
