//! Copy/insert delta codec shared by the line-based and byte-hash compressors.
//!
//! A delta is a base-128 varint (the fulltext length it reconstructs to)
//! followed by a stream of instructions: an insert instruction is a single
//! length byte (1..=0x7f) followed by that many literal bytes; a copy
//! instruction has its top bit set and up to four offset bytes and three
//! length bytes, as selected by the low 7 bits of the command byte.

use byteorder::ReadBytesExt;
use std::io::{Read, Write};

/// Largest number of literal bytes a single insert instruction can carry.
pub const MAX_INSERT_SIZE: usize = 0x7f;

/// Largest number of bytes a single copy instruction can address.
///
/// A copy length of exactly this size is encoded as zero, so callers never
/// need to emit more than two length bytes.
pub const MAX_COPY_SIZE: usize = 0x10000;

/// A single delta instruction, generic over how the payload bytes are held
/// (borrowed, for the zero-copy matcher; owned, for the consuming reader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<T> {
    Insert(T),
    Copy { offset: usize, length: usize },
}

pub fn encode_base128_int(mut val: u128) -> Vec<u8> {
    let mut data = Vec::new();
    while val >= 0x80 {
        data.push(((val | 0x80) & 0xFF) as u8);
        val >>= 7;
    }
    data.push(val as u8);
    data
}

pub fn decode_base128_int(data: &[u8]) -> (u128, usize) {
    let mut offset = 0;
    let mut val: u128 = 0;
    let mut shift = 0;
    let mut bval = data[offset];
    while bval >= 0x80 {
        val |= ((bval & 0x7F) as u128) << shift;
        shift += 7;
        offset += 1;
        bval = data[offset];
    }
    val |= (bval as u128) << shift;
    offset += 1;
    (val, offset)
}

pub fn read_base128_int<R: Read>(r: &mut R) -> std::io::Result<u128> {
    let mut val: u128 = 0;
    let mut shift = 0;
    loop {
        let bval = r.read_u8()?;
        if bval < 0x80 {
            val |= (bval as u128) << shift;
            return Ok(val);
        }
        val |= ((bval & 0x7F) as u128) << shift;
        shift += 7;
    }
}

pub fn write_base128_int<W: Write>(w: &mut W, val: u128) -> std::io::Result<usize> {
    let data = encode_base128_int(val);
    w.write_all(&data)?;
    Ok(data.len())
}

/// Encode a copy instruction. `length` must be in `1..=MAX_COPY_SIZE`.
pub fn encode_copy_instruction(mut offset: usize, mut length: usize) -> Vec<u8> {
    assert!(length > 0, "cannot emit a copy of length 0");
    assert!(
        length <= MAX_COPY_SIZE,
        "copy length {} exceeds MAX_COPY_SIZE",
        length
    );
    let mut copy_command: u8 = 0x80;
    let mut copy_bytes: Vec<u8> = vec![];

    for copy_bit in [0x01, 0x02, 0x04, 0x08].iter() {
        let base_byte = (offset & 0xff) as u8;
        if base_byte != 0 {
            copy_command |= *copy_bit;
            copy_bytes.push(base_byte);
        }
        offset >>= 8;
    }
    if length != MAX_COPY_SIZE {
        // A copy of length exactly 64KiB is sent as a length of 0, since that
        // saves bytes for large chained copies.
        for copy_bit in [0x10, 0x20].iter() {
            let base_byte = (length & 0xff) as u8;
            if base_byte != 0 {
                copy_command |= *copy_bit;
                copy_bytes.push(base_byte);
            }
            length >>= 8;
        }
    }
    copy_bytes.insert(0, copy_command);
    copy_bytes
}

/// Decode a copy instruction. `pos` is the offset into `data` right after
/// the command byte; returns `(offset, length, new_pos)`.
pub fn decode_copy_instruction(
    data: &[u8],
    cmd: u8,
    pos: usize,
) -> Result<(usize, usize, usize), String> {
    if cmd & 0x80 != 0x80 {
        return Err("copy instructions must have bit 0x80 set".to_string());
    }
    let mut offset = 0;
    let mut length = 0;
    let mut new_pos = pos;

    if cmd & 0x01 != 0 {
        offset = data[new_pos] as usize;
        new_pos += 1;
    }
    if cmd & 0x02 != 0 {
        offset |= (data[new_pos] as usize) << 8;
        new_pos += 1;
    }
    if cmd & 0x04 != 0 {
        offset |= (data[new_pos] as usize) << 16;
        new_pos += 1;
    }
    if cmd & 0x08 != 0 {
        offset |= (data[new_pos] as usize) << 24;
        new_pos += 1;
    }
    if cmd & 0x10 != 0 {
        length = data[new_pos] as usize;
        new_pos += 1;
    }
    if cmd & 0x20 != 0 {
        length |= (data[new_pos] as usize) << 8;
        new_pos += 1;
    }
    if cmd & 0x40 != 0 {
        length |= (data[new_pos] as usize) << 16;
        new_pos += 1;
    }
    if length == 0 {
        length = MAX_COPY_SIZE;
    }

    Ok((offset, length, new_pos))
}

/// Decode a single instruction starting at `data[pos]`. Returns the
/// instruction (borrowing its insert bytes from `data`) and the position
/// right after it.
pub fn decode_instruction(data: &[u8], pos: usize) -> Result<(Instruction<&[u8]>, usize), String> {
    let cmd = data[pos];
    let pos = pos + 1;
    if cmd & 0x80 != 0 {
        let (offset, length, new_pos) = decode_copy_instruction(data, cmd, pos)?;
        Ok((Instruction::Copy { offset, length }, new_pos))
    } else {
        if cmd == 0 {
            return Err("Command == 0 not supported yet".to_string());
        }
        let new_pos = pos + cmd as usize;
        Ok((Instruction::Insert(&data[pos..new_pos]), new_pos))
    }
}

/// Read a single instruction from a byte stream, copying the insert payload.
pub fn read_instruction<R: Read>(r: &mut R) -> std::io::Result<Instruction<Vec<u8>>> {
    let cmd = r.read_u8()?;
    if cmd & 0x80 != 0 {
        let mut offset = 0usize;
        let mut length = 0usize;
        if cmd & 0x01 != 0 {
            offset |= r.read_u8()? as usize;
        }
        if cmd & 0x02 != 0 {
            offset |= (r.read_u8()? as usize) << 8;
        }
        if cmd & 0x04 != 0 {
            offset |= (r.read_u8()? as usize) << 16;
        }
        if cmd & 0x08 != 0 {
            offset |= (r.read_u8()? as usize) << 24;
        }
        if cmd & 0x10 != 0 {
            length |= r.read_u8()? as usize;
        }
        if cmd & 0x20 != 0 {
            length |= (r.read_u8()? as usize) << 8;
        }
        if cmd & 0x40 != 0 {
            length |= (r.read_u8()? as usize) << 16;
        }
        if length == 0 {
            length = MAX_COPY_SIZE;
        }
        Ok(Instruction::Copy { offset, length })
    } else {
        if cmd == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Command == 0 not supported yet",
            ));
        }
        let mut buf = vec![0u8; cmd as usize];
        r.read_exact(&mut buf)?;
        Ok(Instruction::Insert(buf))
    }
}

/// Write a single instruction to a byte stream, returning the number of
/// bytes written.
pub fn write_instruction<W: Write, T: AsRef<[u8]>>(
    w: &mut W,
    instr: &Instruction<T>,
) -> std::io::Result<usize> {
    match instr {
        Instruction::Insert(data) => {
            let data = data.as_ref();
            assert!(
                data.len() <= MAX_INSERT_SIZE,
                "insert instruction longer than MAX_INSERT_SIZE"
            );
            w.write_all(&[data.len() as u8])?;
            w.write_all(data)?;
            Ok(1 + data.len())
        }
        Instruction::Copy { offset, length } => {
            let bytes = encode_copy_instruction(*offset, *length);
            w.write_all(&bytes)?;
            Ok(bytes.len())
        }
    }
}

/// Apply a delta (as produced by a compressor) against its basis text.
pub fn apply_delta(basis: &[u8], delta: &[u8]) -> Result<Vec<u8>, String> {
    let (target_length, mut pos) = decode_base128_int(delta);
    let mut content = Vec::new();
    let len_delta = delta.len();

    while pos < len_delta {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let (offset, length, new_pos) = decode_copy_instruction(delta, cmd, pos)?;
            pos = new_pos;
            let last = offset + length;
            if last > basis.len() {
                return Err("data would copy bytes past the end of source".to_string());
            }
            content.extend_from_slice(&basis[offset..last]);
        } else {
            if cmd == 0 {
                return Err("Command == 0 not supported yet".to_string());
            }
            content.extend_from_slice(&delta[pos..pos + cmd as usize]);
            pos += cmd as usize;
        }
    }

    if content.len() != target_length as usize {
        return Err(format!(
            "Delta claimed to be {} long, but ended up {} long",
            target_length,
            content.len()
        ));
    }

    Ok(content)
}

/// Apply the delta found at `source[delta_start..delta_end]` against `source` itself.
pub fn apply_delta_to_source(
    source: &[u8],
    delta_start: usize,
    delta_end: usize,
) -> Result<Vec<u8>, String> {
    let source_size = source.len();
    if delta_start >= source_size {
        return Err("delta starts after source".to_string());
    }
    if delta_end > source_size {
        return Err("delta ends after source".to_string());
    }
    if delta_start >= delta_end {
        return Err("delta starts after it ends".to_string());
    }
    let delta_bytes = &source[delta_start..delta_end];
    apply_delta(source, delta_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base128_roundtrip() {
        for val in [0u128, 1, 0x7f, 0x80, 1000, u32::MAX as u128] {
            let encoded = encode_base128_int(val);
            let (decoded, len) = decode_base128_int(&encoded);
            assert_eq!(decoded, val);
            assert_eq!(len, encoded.len());
            let mut cursor = encoded.as_slice();
            assert_eq!(read_base128_int(&mut cursor).unwrap(), val);
        }
    }

    #[test]
    fn copy_instruction_roundtrip() {
        for (offset, length) in [(0, 1), (255, 256), (1 << 24, MAX_COPY_SIZE), (5, 65535)] {
            let bytes = encode_copy_instruction(offset, length);
            let cmd = bytes[0];
            let (decoded_offset, decoded_length, new_pos) =
                decode_copy_instruction(&bytes, cmd, 1).unwrap();
            assert_eq!(decoded_offset, offset);
            assert_eq!(decoded_length, length);
            assert_eq!(new_pos, bytes.len());
        }
    }

    #[test]
    fn apply_delta_roundtrip() {
        let basis = b"hello world, hello again";
        let mut delta = Vec::new();
        write_base128_int(&mut delta, 11).unwrap();
        write_instruction(&mut delta, &Instruction::<Vec<u8>>::Copy { offset: 0, length: 5 }).unwrap();
        write_instruction(&mut delta, &Instruction::Insert(b" moon".to_vec())).unwrap();
        write_instruction(&mut delta, &Instruction::Insert(b"!".to_vec())).unwrap();
        let applied = apply_delta(basis, &delta).unwrap();
        assert_eq!(applied, b"hello moon!");
    }
}
