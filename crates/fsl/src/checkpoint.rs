// Checkpoint — save and load parameter collections
//
// Binary format (.fslp):
//
//   Header:
//     magic:   [u8; 4]  = b"FSLP"
//     version: u32 LE   = 1
//     count:   u32 LE   = number of slots
//
//   For each slot, in slot order:
//     name_len: u32 LE
//     name:     [u8; name_len]  (UTF-8, e.g. "5.basicblock.bn1.scale")
//     dtype:    u8              (0=F32, 1=F64, 2=I64)
//     ndim:     u32 LE
//     dims:     [u32 LE; ndim]
//     data_len: u64 LE          (in bytes)
//     data:     [u8; data_len]  (raw little-endian typed data)
//
// Loading checks the slot count, every slot name in order and every shape
// against the target config. A slot's header is checked before its data is
// read, and nothing is created or overwritten until every slot has been read.
//
// Usage:
//   checkpoint::save_params("meta.fslp", learner.params())?;
//   let params = checkpoint::load_params::<CpuBackend>("meta.fslp", &config, &CpuDevice)?;
//   checkpoint::load_into("meta.fslp", learner.params())?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use fsl_core::{Backend, DType, Tensor};
use fsl_meta::{LayerConfig, ParameterCollection, SlotLayout, SlotSpec};

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"FSLP";
const VERSION: u32 = 1;

const MAX_NAME_LEN: usize = 1 << 12;
const MAX_RANK: usize = 8;

fn tensor_to_bytes<B: Backend>(tensor: &Tensor<B>) -> Result<Vec<u8>> {
    let data = tensor.contiguous()?.to_f64_vec()?;
    Ok(match tensor.dtype() {
        DType::F32 => data
            .iter()
            .flat_map(|&v| (v as f32).to_le_bytes())
            .collect(),
        DType::F64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
        DType::I64 => data
            .iter()
            .flat_map(|&v| (v as i64).to_le_bytes())
            .collect(),
    })
}

fn bytes_to_f64(bytes: &[u8], dtype: DType) -> Vec<f64> {
    match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        DType::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        DType::I64 => bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64)
            .collect(),
    }
}

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn to_u32(v: usize, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::checkpoint(format!("{} {} does not fit in u32", what, v)))
}

/// One slot as stored on disk.
struct StoredSlot {
    dtype: DType,
    dims: Vec<usize>,
    data: Vec<f64>,
}

/// Write `params` to `writer`.
pub fn write_params<B: Backend>(writer: &mut impl Write, params: &ParameterCollection<B>) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    write_u32(writer, to_u32(params.len(), "slot count")?)?;

    for (slot, tensor) in params.iter() {
        let name = slot.name.as_bytes();
        write_u32(writer, to_u32(name.len(), "name length")?)?;
        writer.write_all(name)?;
        writer.write_all(&[tensor.dtype().tag()])?;

        let dims = tensor.dims();
        write_u32(writer, to_u32(dims.len(), "rank")?)?;
        for &d in dims {
            write_u32(writer, to_u32(d, "dimension")?)?;
        }

        let data = tensor_to_bytes(tensor)?;
        write_u64(writer, data.len() as u64)?;
        writer.write_all(&data)?;
    }
    Ok(())
}

fn slot_err(index: usize, spec: &SlotSpec, msg: String) -> Error {
    Error::checkpoint(format!("slot {} ({}): {}", index, spec.name, msg))
}

/// Read the slot at `index`, checking its header against `spec` before any
/// data is read.
fn read_slot(reader: &mut impl Read, index: usize, spec: &SlotSpec) -> Result<StoredSlot> {
    let name_len = read_u32(reader)? as usize;
    if name_len != spec.name.len() || name_len > MAX_NAME_LEN {
        return Err(slot_err(index, spec, format!("stored name is {} bytes long", name_len)));
    }
    let name = read_bytes(reader, name_len)?;
    if name != spec.name.as_bytes() {
        return Err(slot_err(
            index,
            spec,
            format!("found `{}`", String::from_utf8_lossy(&name)),
        ));
    }

    let tag = read_u8(reader)?;
    let dtype = DType::from_tag(tag).ok_or_else(|| slot_err(index, spec, format!("unknown dtype tag {}", tag)))?;

    let ndim = read_u32(reader)? as usize;
    if ndim != spec.dims.len() || ndim > MAX_RANK {
        return Err(slot_err(
            index,
            spec,
            format!("expected rank {}, found {}", spec.dims.len(), ndim),
        ));
    }
    let mut dims = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        dims.push(read_u32(reader)? as usize);
    }
    if dims != spec.dims {
        return Err(slot_err(
            index,
            spec,
            format!("expected dims {:?}, found {:?}", spec.dims, dims),
        ));
    }

    let expected = dims
        .iter()
        .try_fold(dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| slot_err(index, spec, format!("dims {:?} overflow", dims)))?;
    let data_len = read_u64(reader)?;
    if data_len != expected as u64 {
        return Err(slot_err(
            index,
            spec,
            format!("{} data bytes for dims {:?} of {}", data_len, dims, dtype),
        ));
    }
    let data = bytes_to_f64(&read_bytes(reader, expected)?, dtype);

    Ok(StoredSlot { dtype, dims, data })
}

/// Read every slot and check it against `layout`.
fn read_checked(reader: &mut impl Read, layout: &SlotLayout) -> Result<Vec<StoredSlot>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::checkpoint(format!(
            "expected magic {:?}, got {:?}",
            MAGIC, magic
        )));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::checkpoint(format!(
            "unsupported version {} (expected {})",
            version, VERSION
        )));
    }
    let count = read_u32(reader)? as usize;
    if count != layout.len() {
        return Err(Error::checkpoint(format!(
            "checkpoint has {} slots, config needs {}",
            count,
            layout.len()
        )));
    }

    layout
        .slots
        .iter()
        .enumerate()
        .map(|(i, spec)| read_slot(reader, i, spec))
        .collect()
}

/// Read a collection for `config` from `reader`.
pub fn read_params<B: Backend>(
    reader: &mut impl Read,
    config: &LayerConfig,
    device: &B::Device,
) -> Result<ParameterCollection<B>> {
    let layout = config.slot_layout()?;
    let tensors = read_checked(reader, &layout)?
        .into_iter()
        .map(|s| Ok(Tensor::<B>::from_f64_slice(&s.data, s.dims, s.dtype, device)?))
        .collect::<Result<Vec<_>>>()?;
    Ok(ParameterCollection::from_tensors(config, tensors)?)
}

pub fn to_bytes<B: Backend>(params: &ParameterCollection<B>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_params(&mut buf, params)?;
    Ok(buf)
}

pub fn from_bytes<B: Backend>(
    bytes: &[u8],
    config: &LayerConfig,
    device: &B::Device,
) -> Result<ParameterCollection<B>> {
    let mut reader = bytes;
    read_params(&mut reader, config, device)
}

pub fn save_params<B: Backend>(path: impl AsRef<Path>, params: &ParameterCollection<B>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_params(&mut writer, params)?;
    writer.flush()?;
    Ok(())
}

pub fn load_params<B: Backend>(
    path: impl AsRef<Path>,
    config: &LayerConfig,
    device: &B::Device,
) -> Result<ParameterCollection<B>> {
    let mut reader = BufReader::new(File::open(path)?);
    read_params(&mut reader, config, device)
}

/// Overwrite the values of `params` in place from the checkpoint at `path`.
/// Nothing is written unless the whole file matches the collection's layout.
pub fn load_into<B: Backend>(path: impl AsRef<Path>, params: &ParameterCollection<B>) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let stored = read_checked(&mut reader, params.layout())?;
    for (tensor, slot) in params.tensors().iter().zip(&stored) {
        tensor.update_data_inplace(&slot.data)?;
    }
    Ok(())
}
