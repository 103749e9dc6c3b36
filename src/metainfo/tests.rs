use super::*;
use bytes::Bytes;

#[test]
fn test_from_data_piece_sizes() {
    let data = vec![7u8; 40_000];
    let info = Info::from_data("file.bin", 16384, &data).unwrap();

    assert_eq!(info.piece_count(), 3);
    assert_eq!(info.piece_size(0), 16384);
    assert_eq!(info.piece_size(1), 16384);
    assert_eq!(info.piece_size(2), 40_000 - 2 * 16384);
    assert_eq!(info.piece_size(3), 0);
    assert_eq!(info.total_length, 40_000);
}

#[test]
fn test_verified_checks_hash() {
    let info = Info::from_data("a", 16384, b"hello").unwrap();
    let hash = info.info_hash();

    assert!(Info::verified(info.raw().clone(), &hash).is_ok());

    let wrong = InfoHash([9u8; 20]);
    assert!(matches!(
        Info::verified(info.raw().clone(), &wrong),
        Err(MetainfoError::HashMismatch)
    ));
}

#[test]
fn test_parse_rejects_inconsistent_piece_count() {
    let raw = Bytes::from_static(b"d6:lengthi100e4:name1:a12:piece lengthi10e6:pieces20:aaaaaaaaaaaaaaaaaaaae");
    assert!(matches!(
        Info::parse(raw),
        Err(MetainfoError::InvalidField("pieces"))
    ));
}

#[test]
fn test_parse_multi_file() {
    let raw = Bytes::from_static(
        b"d5:filesld6:lengthi3e4:pathl1:xeed6:lengthi4e4:pathl1:yeee4:name1:d12:piece lengthi8e6:pieces20:aaaaaaaaaaaaaaaaaaaae",
    );
    let info = Info::parse(raw).unwrap();
    assert_eq!(info.total_length, 7);
    assert_eq!(info.piece_count(), 1);
    assert_eq!(info.piece_size(0), 7);
}

#[test]
fn test_info_hash_hex() {
    let hash = InfoHash([0xab; 20]);
    let hex = hash.to_hex();
    assert_eq!(hex.len(), 40);
    assert_eq!(InfoHash::from_hex(&hex).unwrap(), hash);
    assert!(InfoHash::from_hex("abcd").is_err());
}
