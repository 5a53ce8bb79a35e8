// tests/trace_reader_tests.rs
//
// File-level reading: header validation, per-line failures, compression

use std::fs;
use std::io::Write;

use io_replay::record::{CaptureRecord, OpKind, ReplayRecord, TraceKind};
use io_replay::status::{FormatError, TraceError};
use io_replay::tokenizer::TraceLimits;
use io_replay::trace_reader::{probe_header, TraceFileReader, TraceItem};
use tempfile::TempDir;

fn write_trace(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn split(items: impl Iterator<Item = TraceItem<ReplayRecord>>) -> (Vec<(u64, ReplayRecord)>, Vec<(u64, FormatError)>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for item in items {
        match item {
            TraceItem::Record { line, record } => records.push((line, record)),
            TraceItem::Malformed { line, error } => errors.push((line, error)),
            TraceItem::Failed(e) => panic!("unexpected read failure: {}", e),
        }
    }
    (records, errors)
}

#[test]
fn test_version_mismatch_yields_nothing() {
    let dir = TempDir::new().unwrap();
    let path = write_trace(&dir, "v2.replay", b"REPLAY,2\nWRITE,/data/a,4096,0\n");

    match TraceFileReader::<ReplayRecord>::open(&path, TraceLimits::default()) {
        Err(TraceError::VersionMismatch { kind, found, supported }) => {
            assert_eq!(kind, TraceKind::Replay);
            assert_eq!(found, 2);
            assert_eq!(supported, 1);
        }
        Err(e) => panic!("wrong error: {}", e),
        Ok(_) => panic!("version 2 trace was accepted"),
    }
}

#[test]
fn test_one_record_and_one_overlong_line() {
    let dir = TempDir::new().unwrap();
    let mut content = b"REPLAY,1\nWRITE,/data/a,4096,0\n".to_vec();
    content.extend(std::iter::repeat(b'A').take(9000));
    content.push(b'\n');
    let path = write_trace(&dir, "mixed.replay", &content);

    let reader = TraceFileReader::<ReplayRecord>::open(&path, TraceLimits::default()).unwrap();
    let (records, errors) = split(reader);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, 2);
    assert_eq!(records[0].1, ReplayRecord::new(OpKind::Write, "/data/a").with_size(4096));

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 3);
    assert!(matches!(errors[0].1, FormatError::LineTooLong { len: 9000, max: 8192 }));
}

#[test]
fn test_bad_lines_do_not_stop_reading() {
    let dir = TempDir::new().unwrap();
    let path = write_trace(
        &dir,
        "bad.replay",
        b"REPLAY,1\n\
          # comment\n\
          \n\
          SEEK,/a\n\
          READ,/a\n\
          a,b,c,d,e,f,g,h,i,j,k\n\
          STAT,/a\r\n\
          UNLINK,/a",
    );

    let reader = TraceFileReader::<ReplayRecord>::open(&path, TraceLimits::default()).unwrap();
    let (records, errors) = split(reader);

    let kinds: Vec<_> = records.iter().map(|(_, r)| r.kind).collect();
    assert_eq!(kinds, vec![OpKind::Stat, OpKind::Unlink]);
    assert_eq!(records[0].0, 7);
    assert_eq!(records[1].0, 8);

    let lines: Vec<_> = errors.iter().map(|(l, _)| *l).collect();
    assert_eq!(lines, vec![4, 5, 6]);
    assert!(matches!(errors[0].1, FormatError::UnknownOpKind(_)));
    assert!(matches!(errors[1].1, FormatError::MissingField { field: "size", .. }));
    assert!(matches!(errors[2].1, FormatError::TooManyTokens { .. }));
}

#[test]
fn test_header_errors_are_fatal() {
    let dir = TempDir::new().unwrap();
    let limits = TraceLimits::default();

    let empty = write_trace(&dir, "empty", b"");
    assert!(matches!(
        TraceFileReader::<ReplayRecord>::open(&empty, limits),
        Err(TraceError::MissingHeader)
    ));

    let garbage = write_trace(&dir, "garbage", b"WRITE,/data/a,4096,0\n");
    assert!(matches!(
        TraceFileReader::<ReplayRecord>::open(&garbage, limits),
        Err(TraceError::InvalidHeader(_))
    ));

    let capture = write_trace(&dir, "cap", b"CAPTURE,1\n");
    assert!(matches!(
        TraceFileReader::<ReplayRecord>::open(&capture, limits),
        Err(TraceError::WrongTraceKind { .. })
    ));
    assert_eq!(probe_header(&capture, limits).unwrap().kind, TraceKind::Capture);
}

#[test]
fn test_zstd_trace() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.capture.zst");
    let plain = b"CAPTURE,1\nWRITE,/data/a,4096,0,100,2000,7,SUCCESS\nSTAT,/data/a,0,0,150,900,7,ERROR\n";
    let mut enc = zstd::stream::write::Encoder::new(fs::File::create(&path).unwrap(), 3).unwrap();
    enc.write_all(plain).unwrap();
    enc.finish().unwrap();

    let reader = TraceFileReader::<CaptureRecord>::open(&path, TraceLimits::default()).unwrap();
    let records: Vec<CaptureRecord> = reader
        .filter_map(|item| match item {
            TraceItem::Record { record, .. } => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].tid, 7);
    assert_eq!(records[1].kind, OpKind::Stat);
}
