//! Decoding of `.dods` responses: the constrained DDS followed by XDR data.

use super::dds::{parse_dds, ArrayDecl, AtomicType, Dds, Declaration};
use super::DapError;
use crate::dataset::{DatasetError, VariableData};
use bytes::{Buf, Bytes};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Arrays at least this long are converted on the rayon pool.
const PARALLEL_THRESHOLD: usize = 1 << 16;

/// Split a `.dods` body into its DDS and the XDR payload.
pub fn split_dods(body: Bytes) -> Result<(Dds, Bytes), DapError> {
    let (text_end, data_start) = find_separator(&body)
        .ok_or_else(|| DapError::Parse("no 'Data:' separator in .dods response".into()))?;
    let text = std::str::from_utf8(&body[..text_end])
        .map_err(|_| DapError::Parse("DDS section is not valid UTF-8".into()))?;
    let dds = parse_dds(text)?;
    Ok((dds, body.slice(data_start..)))
}

fn find_separator(body: &[u8]) -> Option<(usize, usize)> {
    for marker in [&b"\nData:\n"[..], &b"\nData:\r\n"[..]] {
        if let Some(pos) = body.windows(marker.len()).position(|w| w == marker) {
            return Some((pos + 1, pos + marker.len()));
        }
    }
    None
}

/// Decode the XDR payload described by `dds`.
///
/// Values are keyed with the same names [`Dds::variables`] produces; grid
/// maps that repeat a top-level variable are decoded but kept once.
pub fn decode_values(dds: &Dds, data: Bytes) -> Result<BTreeMap<String, VariableData>, DapError> {
    let mut decoder = XdrDecoder { buf: data };
    let mut out = BTreeMap::new();
    decoder.decode_declarations(&dds.declarations, "", &mut out)?;
    if decoder.buf.has_remaining() {
        tracing::debug!("{} trailing bytes after XDR payload", decoder.buf.remaining());
    }
    Ok(out)
}

struct XdrDecoder {
    buf: Bytes,
}

impl XdrDecoder {
    fn decode_declarations(
        &mut self,
        decls: &[Declaration],
        prefix: &str,
        out: &mut BTreeMap<String, VariableData>,
    ) -> Result<(), DapError> {
        let qualify = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", prefix, name)
            }
        };

        for decl in decls {
            match decl {
                Declaration::Base(array) => {
                    let values = self.decode_array(array)?;
                    out.entry(qualify(&array.name)).or_insert(values);
                }
                Declaration::Grid { name, array, maps } => {
                    let values = self.decode_array(array)?;
                    out.entry(qualify(name)).or_insert(values);
                    for map in maps {
                        let values = self.decode_array(map)?;
                        out.entry(qualify(&map.name)).or_insert(values);
                    }
                }
                Declaration::Structure { name, members } => {
                    self.decode_declarations(members, &qualify(name), out)?
                }
                Declaration::Sequence { name, .. } => {
                    return Err(DapError::Unsupported(format!("sequence {:?}", qualify(name))))
                }
            }
        }
        Ok(())
    }

    fn need(&self, n: usize) -> Result<(), DapError> {
        if self.buf.remaining() < n {
            return Err(DapError::Truncated {
                needed: n,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, DapError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn take(&mut self, n: usize) -> Result<Bytes, DapError> {
        self.need(n)?;
        Ok(self.buf.copy_to_bytes(n))
    }

    /// Opaque bytes padded to a 4-byte boundary.
    fn padded(&mut self, n: usize) -> Result<Bytes, DapError> {
        let bytes = self.take(n)?;
        let pad = (4 - n % 4) % 4;
        self.take(pad)?;
        Ok(bytes)
    }

    fn string(&mut self) -> Result<String, DapError> {
        let len = self.u32()? as usize;
        let bytes = self.padded(len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn decode_array(&mut self, array: &ArrayDecl) -> Result<VariableData, DapError> {
        let shape = array.shape();
        let n = array.element_count()?;

        if array.dims.is_empty() {
            return self.decode_scalar(array.atomic);
        }

        let check_len = |decoder: &mut Self| -> Result<(), DapError> {
            let len = decoder.u32()? as usize;
            if len != n {
                return Err(DapError::LengthMismatch {
                    variable: array.name.clone(),
                    declared: n,
                    encoded: len,
                });
            }
            Ok(())
        };

        let data = match array.atomic {
            AtomicType::String | AtomicType::Url => {
                check_len(self)?;
                let values = (0..n).map(|_| self.string()).collect::<Result<Vec<_>, _>>()?;
                VariableData::from_vec(&shape, values)
            }
            AtomicType::Byte => {
                check_len(self)?;
                check_len(self)?;
                let bytes = self.padded(n)?;
                VariableData::from_vec(&shape, bytes.to_vec())
            }
            atomic => {
                check_len(self)?;
                check_len(self)?;
                let width = if atomic == AtomicType::Float64 { 8 } else { 4 };
                let nbytes = n.checked_mul(width).ok_or_else(|| {
                    DapError::Parse(format!("variable {:?} is too large to decode", array.name))
                })?;
                let raw = self.take(nbytes)?;
                decode_words(atomic, &raw, &shape)
            }
        };
        data.map_err(|e| DapError::Parse(format!("variable {:?}: {}", array.name, e)))
    }

    fn decode_scalar(&mut self, atomic: AtomicType) -> Result<VariableData, DapError> {
        let data = match atomic {
            AtomicType::String | AtomicType::Url => VariableData::from_vec(&[], vec![self.string()?]),
            AtomicType::Byte => VariableData::from_vec(&[], vec![self.u32()? as u8]),
            AtomicType::Int16 => VariableData::from_vec(&[], vec![self.u32()? as i32 as i16]),
            AtomicType::UInt16 => VariableData::from_vec(&[], vec![self.u32()? as u16]),
            AtomicType::Int32 => VariableData::from_vec(&[], vec![self.u32()? as i32]),
            AtomicType::UInt32 => VariableData::from_vec(&[], vec![self.u32()?]),
            AtomicType::Float32 => VariableData::from_vec(&[], vec![f32::from_bits(self.u32()?)]),
            AtomicType::Float64 => {
                self.need(8)?;
                VariableData::from_vec(&[], vec![self.buf.get_f64()])
            }
        };
        data.map_err(|e| DapError::Parse(e.to_string()))
    }
}

/// Big-endian words to typed values. 16-bit types travel as 32-bit words.
fn decode_words(atomic: AtomicType, raw: &[u8], shape: &[usize]) -> Result<VariableData, DatasetError> {
    fn convert<T: Send>(raw: &[u8], width: usize, f: impl Fn(&[u8]) -> T + Sync + Send) -> Vec<T> {
        if raw.len() / width >= PARALLEL_THRESHOLD {
            raw.par_chunks_exact(width).map(f).collect()
        } else {
            raw.chunks_exact(width).map(f).collect()
        }
    }
    let word = |c: &[u8]| u32::from_be_bytes([c[0], c[1], c[2], c[3]]);

    match atomic {
        AtomicType::Int16 => VariableData::from_vec(shape, convert(raw, 4, |c| word(c) as i32 as i16)),
        AtomicType::UInt16 => VariableData::from_vec(shape, convert(raw, 4, |c| word(c) as u16)),
        AtomicType::Int32 => VariableData::from_vec(shape, convert(raw, 4, |c| word(c) as i32)),
        AtomicType::Float32 => VariableData::from_vec(shape, convert(raw, 4, |c| f32::from_bits(word(c)))),
        AtomicType::Float64 => VariableData::from_vec(
            shape,
            convert(raw, 8, |c| {
                f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            }),
        ),
        // Remaining types are 32-bit unsigned words or handled by the caller.
        _ => VariableData::from_vec(shape, convert(raw, 4, word)),
    }
}


#[cfg(test)]
mod tests {
    use super::encode::*;
    use super::*;
    use bytes::{BufMut, BytesMut};
    use ndarray::ArrayD;

    #[test]
    fn test_decode_grid_and_scalar() {
        let dds = parse_dds(
            "Dataset { Float64 time[time = 2]; Grid { ARRAY: Float32 air[time = 2][x = 3]; \
             MAPS: Float64 time[time = 2]; Float32 x[x = 3]; } air; Int32 crs; } d;",
        )
        .unwrap();

        let mut buf = BytesMut::new();
        f64_array(&mut buf, &[0.0, 744.0]);
        f32_array(&mut buf, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        f64_array(&mut buf, &[0.0, 744.0]);
        f32_array(&mut buf, &[10.0, 20.0, 30.0]);
        i32_scalar(&mut buf, -7);

        let values = decode_values(&dds, buf.freeze()).unwrap();
        assert_eq!(values.len(), 4);
        match &values["air"] {
            VariableData::Float32(a) => {
                assert_eq!(a.shape(), &[2, 3]);
                assert_eq!(a[[1, 2]], 6.0);
            }
            other => panic!("unexpected {:?}", other.data_type()),
        }
        assert_eq!(values["crs"], VariableData::Int32(ArrayD::from_elem(vec![], -7)));
    }

    #[test]
    fn test_decode_bytes_shorts_and_strings() {
        let dds = parse_dds(
            "Dataset { Byte flags[3]; Int16 level[2]; String names[2]; String title; } d;",
        )
        .unwrap();

        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u32(3);
        buf.put_slice(&[1, 2, 255, 0]);
        buf.put_u32(2);
        buf.put_u32(2);
        buf.put_i32(-5);
        buf.put_i32(1000);
        buf.put_u32(2);
        string(&mut buf, "ab");
        string(&mut buf, "hello");
        string(&mut buf, "NARR");

        let values = decode_values(&dds, buf.freeze()).unwrap();
        assert_eq!(values["flags"], VariableData::from_vec(&[3], vec![1u8, 2, 255]).unwrap());
        assert_eq!(values["level"], VariableData::from_vec(&[2], vec![-5i16, 1000]).unwrap());
        assert_eq!(
            values["names"],
            VariableData::from_vec(&[2], vec!["ab".to_string(), "hello".to_string()]).unwrap()
        );
        assert_eq!(values["title"], VariableData::from_vec(&[], vec!["NARR".to_string()]).unwrap());
    }

    #[test]
    fn test_truncated_and_length_mismatch() {
        let dds = parse_dds("Dataset { Float32 v[x = 4]; } d;").unwrap();

        let mut short = BytesMut::new();
        f32_array(&mut short, &[1.0, 2.0, 3.0, 4.0]);
        short.truncate(short.len() - 2);
        assert!(matches!(
            decode_values(&dds, short.freeze()),
            Err(DapError::Truncated { .. })
        ));

        let mut wrong = BytesMut::new();
        f32_array(&mut wrong, &[1.0, 2.0]);
        assert!(matches!(
            decode_values(&dds, wrong.freeze()),
            Err(DapError::LengthMismatch { declared: 4, encoded: 2, .. })
        ));
    }

    #[test]
    fn test_oversized_declaration_is_a_parse_error() {
        let dds = parse_dds(&format!("Dataset {{ Float64 v[a = {}][b = 4]; }} d;", usize::MAX)).unwrap();
        let mut body = BytesMut::new();
        f32_array(&mut body, &[1.0]);
        assert!(matches!(decode_values(&dds, body.freeze()), Err(DapError::Parse(_))));
    }

    #[test]
    fn test_split_dods() {
        let mut body = BytesMut::new();
        body.put_slice(b"Dataset {\n    Float32 v[x = 2];\n} d;\nData:\n");
        f32_array(&mut body, &[0.5, 1.5]);

        let (dds, data) = split_dods(body.freeze()).unwrap();
        assert_eq!(dds.name, "d");
        let values = decode_values(&dds, data).unwrap();
        assert_eq!(values["v"], VariableData::from_vec(&[2], vec![0.5f32, 1.5]).unwrap());

        assert!(split_dods(Bytes::from_static(b"Error { code = 404; };")).is_err());
    }

    #[test]
    fn test_large_array_uses_parallel_path() {
        let n = PARALLEL_THRESHOLD + 3;
        let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let dds = parse_dds(&format!("Dataset {{ Float32 v[x = {}]; }} d;", n)).unwrap();
        let mut buf = BytesMut::new();
        f32_array(&mut buf, &values);

        let decoded = decode_values(&dds, buf.freeze()).unwrap();
        assert_eq!(decoded["v"], VariableData::from_vec(&[n], values).unwrap());
    }
}
