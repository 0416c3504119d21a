//! Client calls against a scripted filesystem: arguments reach the delegate
//! intact and results and errors come back intact.

mod common;

use std::io::SeekFrom;
use std::time::{Duration, UNIX_EPOCH};

use common::MockFs;
use netfs::{Error, FileInfo, FileMode, FsError, OpenFlags};

fn sample_info() -> FileInfo {
    FileInfo {
        name: "test_a".to_owned(),
        size: 12345,
        mode: FileMode::from_perm(0o766),
        modified: UNIX_EPOCH + Duration::from_secs(1429348849),
    }
}

fn remote_message(res: netfs::Result<()>) -> String {
    match res {
        Err(Error::Remote(FsError::Message(msg))) => msg,
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn chmod_round_trip() {
    let fs = MockFs::new();
    let (client, _server) = common::connect(&fs).await;

    client
        .chmod("test_a", FileMode::from_perm(0o755))
        .await
        .unwrap();
    assert_eq!(fs.take_calls(), vec!["chmod test_a 755"]);

    fs.fail_with("test text1");
    let err = client
        .chmod("test_a", FileMode::from_perm(0o755))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "test text1");
    assert!(!err.is_fatal());
    assert_eq!(fs.take_calls(), vec!["chmod test_a 755"]);
}

#[tokio::test]
async fn chtimes_keeps_whole_seconds() {
    let fs = MockFs::new();
    let (client, _server) = common::connect(&fs).await;

    let t = UNIX_EPOCH + Duration::from_secs(1429348849);
    fs.fail_with("test text2");
    let res = client.chtimes("test_b", t, t + Duration::from_millis(900)).await;

    assert_eq!(remote_message(res), "test text2");
    assert_eq!(fs.calls(), vec!["chtimes test_b 1429348849 1429348849"]);
}

#[tokio::test]
async fn path_operations_carry_their_arguments() {
    let fs = MockFs::new();
    let (client, _server) = common::connect(&fs).await;
    let perm = FileMode::from_perm(0o755);

    fs.fail_with("test text3");
    assert_eq!(remote_message(client.mkdir("test_c", perm).await), "test text3");
    fs.fail_with("test text4");
    assert_eq!(remote_message(client.mkdir_all("test_d", perm).await), "test text4");
    fs.fail_with("test text5");
    assert_eq!(remote_message(client.remove("test_e").await), "test text5");
    fs.fail_with("test text6");
    assert_eq!(remote_message(client.remove_all("test_f").await), "test text6");
    fs.fail_with("test text7");
    assert_eq!(remote_message(client.rename("test_a", "test_b").await), "test text7");
    fs.fail_with("test text8");
    assert_eq!(remote_message(client.truncate("test_g", 1235).await), "test text8");

    fs.succeed();
    client.mkdir("d", FileMode::from_perm(0o700)).await.unwrap();

    assert_eq!(
        fs.calls(),
        vec![
            "mkdir test_c 755",
            "mkdirall test_d 755",
            "remove test_e",
            "removeall test_f",
            "rename test_a test_b",
            "truncate test_g 1235",
            "mkdir d 700",
        ]
    );
}

#[tokio::test]
async fn stat_with_metadata() {
    let fs = MockFs::new();
    fs.script().info = sample_info();
    let (client, _server) = common::connect(&fs).await;

    let info = client.stat("test_h").await.unwrap();
    assert_eq!(info, sample_info());
    assert_eq!(info.mode.perm(), 0o766);
    assert!(!info.is_dir());

    let info = client.lstat("test_i").await.unwrap();
    assert_eq!(info.name, "test_a");
    assert_eq!(info.size, 12345);

    fs.fail_with("test text9");
    match client.stat("test_h").await {
        Err(Error::Remote(e)) => assert_eq!(e, FsError::msg("test text9")),
        other => panic!("unexpected stat result: {:?}", other),
    }
    assert_eq!(fs.calls(), vec!["stat test_h", "lstat test_i", "stat test_h"]);
}

#[tokio::test]
async fn failed_open_yields_no_handle() {
    let fs = MockFs::new();
    let (client, _server) = common::connect(&fs).await;

    fs.fail_with("test text12");
    let err = client.open("test_l").await.unwrap_err();
    assert_eq!(err.to_string(), "test text12");

    fs.succeed();
    let file = client.create("test_k").await.unwrap();
    assert_eq!(file.fid(), 1);
    assert_eq!(file.name(), "test_k");

    let file = client
        .open_file(
            "test_m",
            OpenFlags::WRONLY | OpenFlags::CREATE,
            FileMode::from_perm(0o711),
        )
        .await
        .unwrap();
    assert_eq!(file.fid(), 2);

    assert_eq!(
        fs.calls(),
        vec!["open test_l", "create test_k", "openfile test_m 0x41 711"]
    );
}

#[tokio::test]
async fn partial_read_past_end() {
    let fs = MockFs::new();
    fs.script().data = b"test".to_vec();
    let (client, _server) = common::connect(&fs).await;

    let file = client.open("test_n").await.unwrap();
    let mut buf = [0u8; 4];
    let res = file.read_at(&mut buf, 1).await.unwrap();

    assert_eq!(res.value, 3);
    assert!(res.is_eof());
    assert_eq!(&buf[..3], b"est");

    let res = file.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(res.value, 4);
    assert_eq!(res.error, None);
}

#[tokio::test]
async fn sequential_reads_end_with_eof() {
    let fs = MockFs::new();
    fs.script().data = b"hello world".to_vec();
    let (client, _server) = common::connect(&fs).await;

    let file = client.open("greeting").await.unwrap();
    let mut collected = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let res = file.read(&mut buf).await.unwrap();
        collected.extend_from_slice(&buf[..res.value]);
        if res.is_eof() {
            break;
        }
    }

    assert_eq!(collected, b"hello world");
    assert_eq!(
        fs.calls().iter().filter(|c| c.starts_with("file read ")).count(),
        4
    );
}

#[tokio::test]
async fn writes_report_counts() {
    let fs = MockFs::new();
    let (client, _server) = common::connect(&fs).await;

    let file = client.create("out").await.unwrap();
    assert_eq!(file.write(b"abc").await.unwrap().into_result(), Ok(3));
    assert_eq!(file.write_str("de").await.unwrap().value, 2);
    assert_eq!(file.write_at(b"xy", 7).await.unwrap().value, 2);
    assert_eq!(fs.script().data, b"abcde");

    fs.fail_with("disk full");
    let res = file.write(b"zz").await.unwrap();
    assert_eq!(res.value, 0);
    assert_eq!(res.error, Some(FsError::msg("disk full")));

    assert_eq!(
        fs.calls()[1..],
        [
            "file write abc out",
            "file write de out",
            "file writeat 7 xy out",
            "file write zz out",
        ]
    );
}

#[tokio::test]
async fn readdir_limits() {
    let fs = MockFs::new();
    fs.script().entries = ["a", "b", "c"]
        .iter()
        .map(|name| FileInfo {
            name: name.to_string(),
            ..sample_info()
        })
        .collect();
    let (client, _server) = common::connect(&fs).await;

    let dir = client.open("dir").await.unwrap();
    let first = dir.readdir(Some(2)).await.unwrap();
    assert_eq!(first.error, None);
    assert_eq!(
        first.value.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
        ["a", "b"]
    );

    let rest = dir.readdirnames(Some(2)).await.unwrap();
    assert_eq!(rest.into_result(), Ok(vec!["c".to_owned()]));

    let done = dir.readdirnames(Some(2)).await.unwrap();
    assert!(done.value.is_empty());
    assert!(done.is_eof());

    let again = client.open("dir").await.unwrap();
    let all = again.readdir(None).await.unwrap();
    assert_eq!(all.value.len(), 3);
    assert_eq!(all.error, None);

    let calls = fs.calls();
    assert!(calls.contains(&"file readdir Some(2) dir".to_owned()));
    assert!(calls.contains(&"file readdir None dir".to_owned()));
}

#[tokio::test]
async fn file_metadata_operations() {
    let fs = MockFs::new();
    fs.script().info = sample_info();
    let (client, _server) = common::connect(&fs).await;

    let file = client.open("meta").await.unwrap();
    assert_eq!(file.stat().await.unwrap(), sample_info());
    file.chmod(FileMode::from_perm(0o600)).await.unwrap();
    file.sync().await.unwrap();
    file.truncate(7).await.unwrap();
    assert_eq!(file.seek(SeekFrom::End(-3)).await.unwrap(), 42);

    fs.fail_with("test text14");
    assert_eq!(file.sync().await.unwrap_err().to_string(), "test text14");
    assert!(file.stat().await.unwrap_err().to_string().contains("test text14"));

    fs.succeed();
    file.close().await.unwrap();

    assert_eq!(
        fs.calls(),
        vec![
            "open meta",
            "file stat meta",
            "file chmod 600 meta",
            "file sync meta",
            "file truncate 7 meta",
            "file seek End(-3) meta",
            "file sync meta",
            "file stat meta",
            "file close meta",
        ]
    );
}

#[tokio::test]
async fn invalid_whence_never_reaches_the_file() {
    let fs = MockFs::new();
    let (mut conn, _server) = common::connect_raw(&fs).await;

    conn.request(netfs::FCall::TOpen { name: "f".into() })
        .await
        .unwrap();
    conn.await_response(netfs::Opcode::Open).await.unwrap();

    conn.request(netfs::FCall::TFileSeek {
        fid: 1,
        offset: 0,
        whence: 9,
    })
    .await
    .unwrap();
    match conn.await_response(netfs::Opcode::FileSeek).await.unwrap() {
        netfs::FCall::RFileSeek { offset, error } => {
            assert_eq!(offset, 0);
            assert!(error.is_some());
        }
        other => panic!("unexpected response: {:?}", other),
    }

    assert_eq!(fs.calls(), vec!["open f"]);
}

#[tokio::test]
async fn ping_and_ordering() {
    let fs = MockFs::new();
    let (client, _server) = common::connect(&fs).await;

    client.ping().await.unwrap();
    for i in 0..20 {
        client.remove(&format!("f{}", i)).await.unwrap();
        client.ping().await.unwrap();
    }

    let expected: Vec<String> = (0..20).map(|i| format!("remove f{}", i)).collect();
    assert_eq!(fs.calls(), expected);
}

#[tokio::test]
async fn clones_share_one_connection() {
    let fs = MockFs::new();
    let (client, _server) = common::connect(&fs).await;

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.mkdir(&format!("d{}", i), FileMode::from_perm(0o755)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut calls = fs.calls();
    calls.sort();
    let mut expected: Vec<String> = (0..8).map(|i| format!("mkdir d{} 755", i)).collect();
    expected.sort();
    assert_eq!(calls, expected);
}

#[tokio::test]
async fn large_transfers() {
    let fs = MockFs::new();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs.script().data = payload.clone();
    let (client, _server) = common::connect(&fs).await;

    let file = client.open("big").await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    let res = file.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(res.into_result(), Ok(payload.len()));
    assert_eq!(buf, payload);
}
