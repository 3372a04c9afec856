#![forbid(unsafe_code)]

use e2_error::E2Error;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn e2mend(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_e2mend"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("run e2mend")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn errno(error: &E2Error) -> i32 {
    error.to_errno()
}

struct Workspace {
    dir: tempfile::TempDir,
    image: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("disk.img");
        let ws = Self { dir, image };
        let out = ws.run(&["mkfs", ws.image_arg()]);
        assert!(out.status.success(), "mkfs failed: {out:?}");
        ws
    }

    fn image_arg(&self) -> &str {
        self.image.to_str().expect("utf-8 temp path")
    }

    fn run(&self, args: &[&str]) -> Output {
        e2mend(args)
    }

    fn host_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("write host file");
        path
    }

    fn image_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.image).expect("read image")
    }
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

#[test]
fn copy_list_and_cat() {
    let ws = Workspace::new();
    let img = ws.image_arg();
    let host = ws.host_file("note.txt", b"hello from the host\n");

    assert!(ws.run(&["mkdir", img, "/docs"]).status.success());
    assert!(ws.run(&["cp", img, arg(&host), "/docs/note"]).status.success());
    assert!(ws.run(&["ln", "-s", img, "/docs/note", "/note"]).status.success());

    let listing = stdout(&ws.run(&["ls", img, "/docs"]));
    assert!(listing.contains("note"));
    assert!(!listing.contains(" ."));

    let cat = ws.run(&["cat", img, "/docs/note"]);
    assert!(cat.status.success());
    assert_eq!(cat.stdout, b"hello from the host\n");
    assert_eq!(ws.run(&["cat", img, "/note"]).stdout, b"/docs/note");
}

#[test]
fn relative_path_is_rejected_before_touching_the_image() {
    let ws = Workspace::new();
    let before = ws.image_bytes();
    let out = ws.run(&["mkdir", ws.image_arg(), "docs"]);

    assert_eq!(
        out.status.code(),
        Some(errno(&E2Error::InvalidPath(String::new())))
    );
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(stderr.lines().count(), 1);
    assert!(stderr.starts_with("e2mend mkdir:"));
    assert_eq!(ws.image_bytes(), before);
}

#[test]
fn errors_map_to_errno() {
    let ws = Workspace::new();
    let img = ws.image_arg();
    assert!(ws.run(&["mkdir", img, "/d"]).status.success());

    let out = ws.run(&["rm", img, "/d"]);
    assert_eq!(out.status.code(), Some(errno(&E2Error::IsDirectory)));
    let out = ws.run(&["mkdir", img, "/d"]);
    assert_eq!(out.status.code(), Some(errno(&E2Error::Exists)));
    let out = ws.run(&["mkdir", img, "/x/y"]);
    assert_eq!(out.status.code(), Some(errno(&E2Error::NotFound(String::new()))));

    let missing = ws.dir.path().join("missing.img");
    let out = ws.run(&["ls", arg(&missing), "/"]);
    assert_eq!(
        out.status.code(),
        Some(errno(&E2Error::ImageUnavailable(String::new())))
    );
}

#[test]
fn remove_restore_and_check() {
    let ws = Workspace::new();
    let img = ws.image_arg();
    let host = ws.host_file("data", &[42_u8; 3000]);

    assert!(ws.run(&["mkdir", img, "/d"]).status.success());
    assert!(ws.run(&["cp", img, arg(&host), "/d/data"]).status.success());
    assert!(ws.run(&["rm", "-r", img, "/d"]).status.success());
    assert!(!stdout(&ws.run(&["ls", img, "/"])).contains(" d\n"));

    let out = ws.run(&["restore", img, "/d"]);
    assert_eq!(out.status.code(), Some(errno(&E2Error::IsDirectory)));
    assert!(ws.run(&["restore", "-r", img, "/d"]).status.success());
    assert!(ws.run(&["restore", img, "/d/data"]).status.success());
    assert_eq!(ws.run(&["cat", img, "/d/data"]).stdout, vec![42_u8; 3000]);

    let check = ws.run(&["checker", img]);
    assert!(check.status.success());
    assert_eq!(stdout(&check), "No file system inconsistencies detected!\n");
}

#[test]
fn mkfs_refuses_to_overwrite() {
    let ws = Workspace::new();
    let out = ws.run(&["mkfs", ws.image_arg()]);
    assert_eq!(out.status.code(), Some(errno(&E2Error::Exists)));
    assert!(ws.run(&["mkfs", "--force", ws.image_arg()]).status.success());
}

#[test]
fn inspect_json_describes_the_image() {
    let ws = Workspace::new();
    let out = ws.run(&["inspect", ws.image_arg(), "--json"]);
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(json["blocks_count"], 128);
    assert_eq!(json["group"]["free_blocks"], 117);
    assert_eq!(json["inodes"].as_array().expect("inodes").len(), 2);
}
