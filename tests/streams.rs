//! The buffered stream invariants: borrowed reads see the file
//! contents at the cumulative mark, end-of-file reads as NUL, and
//! overwrite back-patches land whether or not the bytes were flushed.

mod common;

use common::Wire;
use ninebridge::nine::buf::{ReadStream, WriteStream};
use ninebridge::nine::fid;

#[tokio::test]
async fn borrowed_bytes_match_the_file_at_the_mark() {
    let mut wire = Wire::new(|_| {}).await;
    let f = wire.open_file(fid::VOL_A, "data", b"abcdefghijklmnopqrstuvwxyz").await;

    let mut rs = ReadStream::new(f, 8);
    let win = rs.borrow(&mut wire.nine, 4).await.unwrap();
    assert_eq!(&win[..4], b"abcd");
    rs.give_back(3);

    // Mark advanced by exactly what was consumed
    let win = rs.borrow(&mut wire.nine, 4).await.unwrap();
    assert_eq!(&win[..4], b"defg");
    rs.give_back(4);
    assert_eq!(rs.tell(), 7);
}

#[tokio::test]
async fn seeking_and_refilling_keeps_equivalence() {
    let contents: Vec<u8> = (0u8..200).collect();
    let mut wire = Wire::new(|_| {}).await;
    let f = wire.open_file(fid::VOL_A, "data", &contents).await;

    let mut rs = ReadStream::new(f, 16);
    for &start in &[0u64, 5, 100, 190, 13] {
        rs.seek(start);
        let win = rs.borrow(&mut wire.nine, 8).await.unwrap();
        assert_eq!(&win[..8], &contents[start as usize..start as usize + 8]);
        rs.give_back(8);
    }
}

#[tokio::test]
async fn past_eof_is_zero_extended() {
    let mut wire = Wire::new(|_| {}).await;
    let f = wire.open_file(fid::VOL_A, "short", b"ab").await;

    let mut rs = ReadStream::new(f, 16);
    let win = rs.borrow(&mut wire.nine, 8).await.unwrap();
    assert_eq!(&win[..8], b"ab\0\0\0\0\0\0");
    rs.give_back(0);

    // Even when the mark is already past the end
    rs.seek(100);
    let win = rs.borrow(&mut wire.nine, 4).await.unwrap();
    assert_eq!(&win[..4], [0, 0, 0, 0]);
}

#[tokio::test]
async fn single_byte_helpers() {
    let mut wire = Wire::new(|_| {}).await;
    let f = wire.open_file(fid::VOL_A, "tokens", b"xy").await;

    let mut rs = ReadStream::new(f, 8);
    assert_eq!(rs.peek(&mut wire.nine).await.unwrap(), b'x');
    assert_eq!(rs.read_byte(&mut wire.nine).await.unwrap(), b'x');
    assert!(!rs.read_if(&mut wire.nine, b'z').await.unwrap());
    assert!(rs.read_if(&mut wire.nine, b'y').await.unwrap());
    assert_eq!(rs.read_byte(&mut wire.nine).await.unwrap(), 0); // EOF
}

#[tokio::test]
async fn write_stream_buffers_and_flushes() {
    let mut wire = Wire::new(|_| {}).await;
    let f = wire.open_file(fid::VOL_A, "out", b"").await;

    let mut ws = WriteStream::new(f, 8);
    ws.push(&mut wire.nine, b"hello").await.unwrap();
    assert_eq!(wire.tree.lock().unwrap().file_bytes("out").unwrap(), b""); // still buffered

    ws.push(&mut wire.nine, b" worl").await.unwrap(); // forces a flush of "hello"
    ws.put(&mut wire.nine, b'd').await.unwrap();
    ws.flush(&mut wire.nine).await.unwrap();

    assert_eq!(wire.tree.lock().unwrap().file_bytes("out").unwrap(), b"hello world");
}

#[tokio::test]
async fn overwrite_patches_buffered_and_flushed_bytes_alike() {
    let mut wire = Wire::new(|_| {}).await;
    let f = wire.open_file(fid::VOL_A, "patch", b"").await;

    let mut ws = WriteStream::new(f, 8);
    ws.push(&mut wire.nine, b"AAAABBBB").await.unwrap(); // fills the buffer
    ws.push(&mut wire.nine, b"CCCC").await.unwrap(); // flushes the first eight

    // Patch a span straddling flushed ("BB") and buffered ("CC") bytes
    ws.overwrite(&mut wire.nine, 6, b"xxxx").await.unwrap();
    ws.flush(&mut wire.nine).await.unwrap();

    assert_eq!(wire.tree.lock().unwrap().file_bytes("patch").unwrap(), b"AAAABBxxxxCC");
}

#[tokio::test]
async fn borrowed_write_window() {
    let mut wire = Wire::new(|_| {}).await;
    let f = wire.open_file(fid::VOL_A, "borrowed", b"").await;

    let mut ws = WriteStream::new(f, 8);
    let win = ws.borrow(&mut wire.nine, 4).await.unwrap();
    win[0..3].copy_from_slice(b"abc");
    ws.give_back(3);
    ws.flush(&mut wire.nine).await.unwrap();

    assert_eq!(wire.tree.lock().unwrap().file_bytes("borrowed").unwrap(), b"abc");
}
