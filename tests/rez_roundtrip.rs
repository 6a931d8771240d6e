//! The Rez/DeRez codec against its binary layout, including the
//! compile-decompile-compile fixpoint.

mod common;

use common::Wire;
use ninebridge::nine::{fid, O_CREAT, O_RDONLY, O_TRUNC, O_WRONLY};
use ninebridge::rez::{derez, rez};

/// Compile Rez text to a fork image, returning (image, reported size).
async fn compile(wire: &mut Wire, stem: &str, text: &[u8]) -> (Vec<u8>, u32) {
    let src = format!("{}.rdump", stem);
    let out = format!("{}.bin", stem);
    wire.tree.lock().unwrap().put_file(&src, text);

    wire.nine.walk_path(fid::ROOT, fid::VOL_A, &src).await.unwrap();
    wire.nine.lopen(fid::VOL_A, O_RDONLY).await.unwrap();

    wire.nine.walk_path(fid::ROOT, fid::VOL_B, "").await.unwrap();
    wire.nine
        .lcreate(fid::VOL_B, &out, O_WRONLY | O_CREAT | O_TRUNC, 0o666, 0)
        .await
        .unwrap();

    let size = rez(&mut wire.nine, fid::VOL_A, fid::VOL_B).await.unwrap();
    wire.nine.clunk(fid::VOL_A).await.unwrap();
    wire.nine.clunk(fid::VOL_B).await.unwrap();

    (wire.tree.lock().unwrap().file_bytes(&out).unwrap(), size)
}

/// Decompile a fork image back to Rez text.
async fn decompile(wire: &mut Wire, stem: &str, image: &[u8]) -> Vec<u8> {
    let src = format!("{}.bin2", stem);
    let out = format!("{}.rdump2", stem);
    wire.tree.lock().unwrap().put_file(&src, image);

    wire.nine.walk_path(fid::ROOT, fid::VOL_A, &src).await.unwrap();
    wire.nine.lopen(fid::VOL_A, O_RDONLY).await.unwrap();

    wire.nine.walk_path(fid::ROOT, fid::VOL_B, "").await.unwrap();
    wire.nine
        .lcreate(fid::VOL_B, &out, O_WRONLY | O_CREAT | O_TRUNC, 0o666, 0)
        .await
        .unwrap();

    derez(&mut wire.nine, fid::VOL_A, fid::VOL_B).await.unwrap();
    wire.nine.clunk(fid::VOL_A).await.unwrap();
    wire.nine.clunk(fid::VOL_B).await.unwrap();

    wire.tree.lock().unwrap().file_bytes(&out).unwrap()
}

#[tokio::test]
async fn single_resource_layout() {
    let mut wire = Wire::new(|_| {}).await;
    let text = b"data 'ABCD' (128, \"hi\") {\n\t$\"00 01 02 03\"\n};\n";
    let (image, size) = compile(&mut wire, "single", text).await;

    // header: data at 256, map at 264, 8 bytes of data (4-byte length
    // prefix + body), 53 bytes of map
    assert_eq!(&image[0..4], &256u32.to_be_bytes());
    assert_eq!(&image[4..8], &264u32.to_be_bytes());
    assert_eq!(&image[8..12], &8u32.to_be_bytes());
    assert_eq!(&image[12..16], &53u32.to_be_bytes());
    assert_eq!(size, 264 + 53);
    assert_eq!(image.len() as u32, size);

    // data section: length prefix then the four bytes
    assert_eq!(&image[256..260], &4u32.to_be_bytes());
    assert_eq!(&image[260..264], &[0, 1, 2, 3]);

    let map = &image[264..];
    // type list at 28 from map start, name list right after the lists
    assert_eq!(&map[24..26], &28u16.to_be_bytes());
    assert_eq!(&map[26..28], &50u16.to_be_bytes());
    assert_eq!(&map[28..30], &0u16.to_be_bytes()); // one type, minus one

    // the single type record
    assert_eq!(&map[30..34], b"ABCD");
    assert_eq!(&map[34..36], &0u16.to_be_bytes()); // one resource, minus one
    assert_eq!(&map[36..38], &10u16.to_be_bytes()); // refs offset from type list

    // the single reference: id 128, named, data offset 0
    let refrec = &map[28 + 10..28 + 10 + 12];
    assert_eq!(&refrec[0..2], &128i16.to_be_bytes());
    assert_eq!(&refrec[2..4], &0u16.to_be_bytes()); // name offset
    assert_eq!(&refrec[4..8], &0u32.to_be_bytes()); // attrs 0, offset 0

    // the name list
    assert_eq!(&map[50..53], b"\x02hi");
}

#[tokio::test]
async fn resources_are_sorted_by_type_then_id() {
    let mut wire = Wire::new(|_| {}).await;
    let text = b"\
data 'ZZZZ' (2) {\n\t$\"22\"\n};\n\n\
data 'AAAA' (7) {\n\t$\"07\"\n};\n\n\
data 'ZZZZ' (-1) {\n\t$\"11\"\n};\n\n\
data 'AAAA' (3) {\n\t$\"03\"\n};\n";
    let (image, _) = compile(&mut wire, "sorted", text).await;

    let map_off = u32::from_be_bytes(image[4..8].try_into().unwrap()) as usize;
    let map = &image[map_off..];
    let ntype = u16::from_be_bytes(map[28..30].try_into().unwrap()) + 1;
    assert_eq!(ntype, 2);

    // types in ascending order
    assert_eq!(&map[30..34], b"AAAA");
    assert_eq!(&map[38..42], b"ZZZZ");

    // ids ascending within a type, signed
    let refs = 28 + u16::from_be_bytes(map[36..38].try_into().unwrap()) as usize;
    let id0 = i16::from_be_bytes(map[refs..refs + 2].try_into().unwrap());
    let id1 = i16::from_be_bytes(map[refs + 12..refs + 14].try_into().unwrap());
    assert_eq!((id0, id1), (3, 7));

    let zrefs = 28 + u16::from_be_bytes(map[44..46].try_into().unwrap()) as usize;
    let zid0 = i16::from_be_bytes(map[zrefs..zrefs + 2].try_into().unwrap());
    let zid1 = i16::from_be_bytes(map[zrefs + 12..zrefs + 14].try_into().unwrap());
    assert_eq!((zid0, zid1), (-1, 2));
}

#[tokio::test]
async fn compile_decompile_compile_is_a_fixpoint() {
    let mut wire = Wire::new(|_| {}).await;
    let text = b"\
data 'TEXT' (0, \"plain, \\\"quoted\\\"\", purgeable, locked) {\n\
\t$\"48656c6c 6f2c2077 6f726c64 21\"\n\
};\n\n\
data 'ICN#' (-16455) {\n\
\t$\"00FF 2A2F 2F2A\"\n\
};\n\n\
data 'TEXT' (128, $C1) {\n\
\t$\"\"\n\
};\n";
    let (image1, _) = compile(&mut wire, "fix", text).await;
    let text2 = decompile(&mut wire, "fix", &image1).await;
    let (image2, _) = compile(&mut wire, "fix2", &text2).await;
    assert_eq!(image1, image2);
}

#[tokio::test]
async fn gloss_never_terminates_its_own_comment() {
    let mut wire = Wire::new(|_| {}).await;
    // The body bytes spell "*/" which must be defanged in the gloss
    let text = b"data 'GLOS' (1) {\n\t$\"2A2F 2A2F\"\n};\n";
    let (image, _) = compile(&mut wire, "gloss", text).await;
    let out = decompile(&mut wire, "gloss", &image).await;

    let rendered = String::from_utf8_lossy(&out);
    let line = rendered.lines().find(|l| l.contains("2A2F")).expect("hex row");
    assert!(line.contains("*."), "slash after star must become a dot: {}", line);
    assert_eq!(line.matches("*/").count(), 1, "only the comment closer survives");
}

#[tokio::test]
async fn escaped_names_round_trip() {
    let mut wire = Wire::new(|_| {}).await;
    let text = b"data 'ESCP' (5, \"tab\\there\\0xFFend\") {\n\t$\"01\"\n};\n";
    let (image1, _) = compile(&mut wire, "esc", text).await;

    // The stored pascal name has the raw bytes
    let map_off = u32::from_be_bytes(image1[4..8].try_into().unwrap()) as usize;
    let name_off = u16::from_be_bytes(image1[map_off + 26..map_off + 28].try_into().unwrap());
    let name_at = map_off + name_off as usize;
    let len = image1[name_at] as usize;
    assert_eq!(&image1[name_at + 1..name_at + 1 + len], b"tab\there\xFFend");

    let text2 = decompile(&mut wire, "esc", &image1).await;
    let (image2, _) = compile(&mut wire, "esc2", &text2).await;
    assert_eq!(image1, image2);
}

#[tokio::test]
async fn empty_body_is_a_zero_length_resource() {
    let mut wire = Wire::new(|_| {}).await;
    let text = b"data 'NULL' (0) {\n};\n";
    let (image, _) = compile(&mut wire, "empty", text).await;
    assert_eq!(&image[8..12], &4u32.to_be_bytes()); // just the length prefix
    assert_eq!(&image[256..260], &0u32.to_be_bytes());
}
