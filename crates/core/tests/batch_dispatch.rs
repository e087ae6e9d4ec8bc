use std::path::PathBuf;

use fleetput_core::{
    ErrorKind, FileSet, InMemoryConnector, TransferOptions, dispatch_all, dispatch_all_with,
    parse_inline, parse_list,
};
use tempfile::TempDir;

fn write_file(path: PathBuf, bytes: &[u8]) -> PathBuf {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, bytes).unwrap();
    path
}

fn files(temp: &TempDir) -> FileSet {
    FileSet::new(vec![
        write_file(temp.path().join("a.txt"), &[1u8; 100]),
        write_file(temp.path().join("b.txt"), &[2u8; 250]),
    ])
}

#[tokio::test]
async fn unreachable_destination_does_not_affect_the_others() {
    let temp = TempDir::new().unwrap();
    let files = files(&temp);
    let parsed = parse_list(
        "sftp:h1:/r/:u:p\nftp:h2:/r/:u:p\nscp:h3:/r/:u:p\nsmb:h4:/share/r/:u:p\ns3:bucket-five\n",
    );
    assert!(parsed.rejected.is_empty());

    let connector = InMemoryConnector::new().unreachable("h3");
    let entries = dispatch_all(&connector, &files, &parsed.specs).await;

    assert_eq!(entries.len(), 5);
    for (k, entry) in entries.iter().enumerate() {
        assert_eq!(entry.destination, parsed.specs[k]);
        if k == 2 {
            let err = entry.result.as_ref().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Connection);
        } else {
            let report = entry.result.as_ref().unwrap();
            assert!(report.is_success());
            assert_eq!(report.bytes_sent(), 350);
        }
    }

    let log = connector.log();
    assert!(log.puts_to("h3").is_empty());
    assert_eq!(log.puts_to("bucket-five").len(), 2);
}

#[tokio::test]
async fn object_storage_credential_failure_is_independent() {
    let temp = TempDir::new().unwrap();
    let files = files(&temp);
    let parsed = parse_inline("ftp:h1:/d/:u:p,s3:mybucket");
    assert_eq!(parsed.specs.len(), 2);

    let connector = InMemoryConnector::new().without_object_credentials();
    let entries = dispatch_all(&connector, &files, &parsed.specs).await;
    assert!(entries[0].is_success());
    assert_eq!(
        entries[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::CredentialResolution
    );

    let connector = InMemoryConnector::new()
        .unreachable("h1")
        .without_object_credentials();
    let entries = dispatch_all(&connector, &files, &parsed.specs).await;
    assert_eq!(
        entries[0].result.as_ref().unwrap_err().kind(),
        ErrorKind::Connection
    );
    assert_eq!(
        entries[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::CredentialResolution
    );
}

#[tokio::test]
async fn malformed_entries_are_reported_and_valid_ones_still_run() {
    let temp = TempDir::new().unwrap();
    let files = files(&temp);
    let parsed = parse_list("sftp:h1:/r/:u:p\nsftp:h2:/r/:u\ngopher:h3:/r/:u:p\n\nscp:h4:/r/:u:p\n");
    assert_eq!(parsed.specs.len(), 2);
    let positions: Vec<usize> = parsed.rejected.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![2, 3]);

    let connector = InMemoryConnector::new();
    let entries =
        dispatch_all_with(&connector, &files, &parsed.specs, TransferOptions::default(), 4).await;
    assert!(entries.iter().all(|e| e.is_success()));
    assert_eq!(connector.log().opens.len(), 2);
}
