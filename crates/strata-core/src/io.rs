// IO — Array serialization
//
// Single array (all integers little endian):
//
//     tag:   u32  = 0xF993_FAC8
//     ndim:  u32                 (0 = none-state array, nothing follows)
//     dims:  [u32; ndim]
//     kind:  i32                 (device mask: 1 = cpu, 2 = gpu)
//     id:    i32                 (device index)
//     data:  [f32; product(dims)]
//
// Array list:
//
//     magic:    u64 = 0x112
//     reserved: u64 = 0
//     count:    u64, then `count` single arrays
//     names:    u64 (0 or count), then per name: len u64 + UTF-8 bytes
//
// Loading never hands back a partially read list: any malformed or truncated
// stream is Error::Format.
//
// Usage:
//   io::save_list("params.bin", &arrays, Some(&names))?;
//   let (arrays, names) = io::load_list("params.bin", &engine)?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::array::Array;
use crate::context::{Context, DeviceKind};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::shape::Shape;

/// Leading tag of a serialized array.
pub const ARRAY_TAG: u32 = 0xF993_FAC8;
/// Leading magic of a serialized array list.
pub const LIST_MAGIC: u64 = 0x112;

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_i32(w: &mut impl Write, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn read_array_of<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    read_array_of::<4>(r).map(u32::from_le_bytes)
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    read_array_of::<4>(r).map(i32::from_le_bytes)
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    read_array_of::<8>(r).map(u64::from_le_bytes)
}

fn read_bytes(r: &mut impl Read, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let got = r.take(len).read_to_end(&mut buf).map_err(io_err)?;
    if (got as u64) < len {
        return Err(Error::format(format!(
            "stream truncated: expected {len} bytes, got {got}"
        )));
    }
    Ok(buf)
}

/// Truncation is a format problem, everything else is an IO failure.
fn io_err(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::format("stream truncated")
    } else {
        Error::Io(e)
    }
}

// Single array

impl Array {
    /// Serialize shape, context and data. Waits for pending writes.
    pub fn save(&self, w: &mut impl Write) -> Result<()> {
        write_u32(w, ARRAY_TAG)?;
        let dims = self.shape().dims();
        write_u32(w, dims.len() as u32)?;
        if self.is_none() {
            return Ok(());
        }
        for &d in dims {
            let d = u32::try_from(d)
                .map_err(|_| Error::format(format!("dimension {d} does not fit in u32")))?;
            write_u32(w, d)?;
        }
        let ctx = self.context();
        write_i32(w, ctx.kind.mask())?;
        write_i32(w, ctx.id as i32)?;
        let data = self.to_vec()?;
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        w.write_all(&bytes).map_err(io_err)
    }

    /// Read an array written by [`Array::save`] onto `engine`.
    pub fn load(r: &mut impl Read, engine: &Engine) -> Result<Array> {
        let tag = read_u32(r)?;
        if tag != ARRAY_TAG {
            return Err(Error::format(format!(
                "bad array tag {tag:#x}, expected {ARRAY_TAG:#x}"
            )));
        }
        let ndim = read_u32(r)? as usize;
        if ndim == 0 {
            return Ok(Array::none());
        }
        let mut dims = Vec::with_capacity(ndim.min(32));
        for _ in 0..ndim {
            dims.push(read_u32(r)? as usize);
        }
        let shape = Shape::new(dims);

        let kind = DeviceKind::from_mask(read_i32(r)?)?;
        if kind == DeviceKind::Unset {
            return Err(Error::format("shaped array without a device"));
        }
        let id = u32::try_from(read_i32(r)?)
            .map_err(|_| Error::format("negative device id"))?;
        let context = Context::new(kind, id);

        let count = shape
            .dims()
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d as u64))
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| Error::format(format!("shape {shape} is too large")))?;
        let bytes = read_bytes(r, count)?;
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let array = Array::new(shape, context, false, engine);
        array.sync_copy_from_cpu(&data)?;
        Ok(array)
    }

    /// [`Array::save`] into a byte buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save(&mut buf)?;
        Ok(buf)
    }

    /// [`Array::load`] from a byte buffer.
    pub fn from_bytes(bytes: &[u8], engine: &Engine) -> Result<Array> {
        let mut cursor = bytes;
        Array::load(&mut cursor, engine)
    }
}

// Array lists

/// Write `arrays` and optional `names` (one per array) as an array list.
pub fn write_list(w: &mut impl Write, arrays: &[Array], names: Option<&[String]>) -> Result<()> {
    if let Some(names) = names {
        if names.len() != arrays.len() {
            return Err(Error::ArgumentCount {
                what: "array list names",
                expected: arrays.len(),
                got: names.len(),
            });
        }
    }
    write_u64(w, LIST_MAGIC)?;
    write_u64(w, 0)?;
    write_u64(w, arrays.len() as u64)?;
    for array in arrays {
        array.save(w)?;
    }
    let names = names.unwrap_or(&[]);
    write_u64(w, names.len() as u64)?;
    for name in names {
        write_u64(w, name.len() as u64)?;
        w.write_all(name.as_bytes()).map_err(io_err)?;
    }
    Ok(())
}

/// Read an array list. The name list is empty when none was saved.
pub fn read_list(r: &mut impl Read, engine: &Engine) -> Result<(Vec<Array>, Vec<String>)> {
    let magic = read_u64(r)?;
    if magic != LIST_MAGIC {
        return Err(Error::format(format!(
            "bad array list magic {magic:#x}, expected {LIST_MAGIC:#x}"
        )));
    }
    let reserved = read_u64(r)?;
    if reserved != 0 {
        return Err(Error::format(format!("reserved header field is {reserved}")));
    }

    let count = read_u64(r)?;
    let mut arrays = Vec::new();
    for _ in 0..count {
        arrays.push(Array::load(r, engine)?);
    }

    let name_count = read_u64(r)?;
    if name_count != 0 && name_count != count {
        return Err(Error::format(format!(
            "{name_count} names for {count} arrays"
        )));
    }
    let mut names = Vec::new();
    for _ in 0..name_count {
        let len = read_u64(r)?;
        let bytes = read_bytes(r, len)?;
        let name = String::from_utf8(bytes)
            .map_err(|e| Error::format(format!("array name is not UTF-8: {e}")))?;
        names.push(name);
    }
    Ok((arrays, names))
}

/// Save an array list to a file.
pub fn save_list(path: impl AsRef<Path>, arrays: &[Array], names: Option<&[String]>) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_list(&mut writer, arrays, names)?;
    writer.flush()?;
    Ok(())
}

/// Load an array list from a file.
pub fn load_list(path: impl AsRef<Path>, engine: &Engine) -> Result<(Vec<Array>, Vec<String>)> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_list(&mut reader, engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_array_layout() {
        let engine = Engine::synchronous().unwrap();
        let a = Array::from_vec(vec![1.5, -2.0], 2, &engine).unwrap();
        let bytes = a.to_bytes().unwrap();
        // tag + ndim + 1 dim + kind + id + 2 floats
        assert_eq!(bytes.len(), 4 * 5 + 8);
        assert_eq!(&bytes[0..4], &ARRAY_TAG.to_le_bytes());

        let b = Array::from_bytes(&bytes, &engine).unwrap();
        assert_eq!(b.shape(), a.shape());
        assert_eq!(b.context(), Context::cpu());
        assert_eq!(b.to_vec().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_none_array_roundtrip() {
        let engine = Engine::synchronous().unwrap();
        let bytes = Array::none().to_bytes().unwrap();
        assert_eq!(bytes.len(), 8);
        assert!(Array::from_bytes(&bytes, &engine).unwrap().is_none());
    }

    #[test]
    fn test_bad_tag() {
        let engine = Engine::synchronous().unwrap();
        let err = Array::from_bytes(&[0, 0, 0, 0, 0, 0, 0, 0], &engine).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_truncated_array() {
        let engine = Engine::synchronous().unwrap();
        let a = Array::from_vec(vec![1.0, 2.0, 3.0], 3, &engine).unwrap();
        let bytes = a.to_bytes().unwrap();
        let err = Array::from_bytes(&bytes[..bytes.len() - 2], &engine).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_name_count_must_match() {
        let engine = Engine::synchronous().unwrap();
        let a = Array::from_vec(vec![1.0], 1, &engine).unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        let mut buf = Vec::new();
        assert!(matches!(
            write_list(&mut buf, &[a], Some(&names)),
            Err(Error::ArgumentCount { .. })
        ));
    }
}
