use std::io::{BufRead, BufReader, Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use half::f16;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Packs vectors as IEEE-754 binary16, little-endian, two bytes per element.
pub fn encode_f16(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().saturating_mul(2));
    for value in values {
        out.extend_from_slice(&f16::from_f32(*value).to_le_bytes());
    }
    out
}

pub fn decode_f16(bytes: &[u8]) -> Result<Vec<f32>, AppError> {
    if bytes.len() % 2 != 0 {
        return Err(AppError::Consistency(format!(
            "f16 buffer has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
        .collect())
}

/// Raw f32 little-endian buffer, used for resumable partial embeddings.
pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().saturating_mul(4));
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_f32(bytes: &[u8]) -> Result<Vec<f32>, AppError> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::Consistency(format!(
            "f32 buffer length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
        .collect())
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, AppError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, AppError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn gzip_json<T: Serialize>(value: &T) -> Result<Vec<u8>, AppError> {
    gzip(&serde_json::to_vec(value)?)
}

pub fn gunzip_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AppError> {
    Ok(serde_json::from_slice(&gunzip(bytes)?)?)
}

/// One JSON document per line, gzip-compressed.
pub fn gzip_jsonl<T: Serialize>(records: &[T]) -> Result<Vec<u8>, AppError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for record in records {
        serde_json::to_writer(&mut encoder, record)?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

pub fn gunzip_jsonl<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, AppError> {
    let reader = BufReader::new(GzDecoder::new(bytes));
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_round_trip_within_tolerance() {
        let values = [0.0_f32, 1.0, -1.0, 0.333_333, 0.5, -0.125, 0.999, 12.75];
        let decoded = decode_f16(&encode_f16(&values)).expect("decode");
        assert_eq!(decoded.len(), values.len());
        for (original, back) in values.iter().zip(&decoded) {
            let tolerance = original.abs().max(1.0) * 1e-3;
            assert!(
                (original - back).abs() <= tolerance,
                "{original} came back as {back}"
            );
        }
        assert_eq!(encode_f16(&values).len(), values.len() * 2);
    }

    #[test]
    fn f16_keeps_special_values() {
        let decoded =
            decode_f16(&encode_f16(&[f32::NAN, f32::INFINITY, f32::NEG_INFINITY])).expect("decode");
        assert!(decoded[0].is_nan());
        assert_eq!(decoded[1], f32::INFINITY);
        assert_eq!(decoded[2], f32::NEG_INFINITY);
    }

    #[test]
    fn f16_is_little_endian() {
        // 1.0 in binary16 is 0x3C00
        assert_eq!(encode_f16(&[1.0]), vec![0x00, 0x3C]);
        assert!(decode_f16(&[0x00]).is_err());
    }

    #[test]
    fn jsonl_skips_blank_lines() {
        let raw = b"{\"a\":1}\n\n{\"a\":2}\n";
        let packed = gzip(raw).expect("gzip");
        let values: Vec<serde_json::Value> = gunzip_jsonl(&packed).expect("jsonl");
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["a"], 2);
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
