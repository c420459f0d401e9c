//! Little-endian binary payloads for weight matrices and area vectors.
//!
//! Matrix payload:
//! ```text
//! u32 matrix count
//! per matrix: u64 n_src, u64 n_dst, u64 nnz,
//!             (n_dst + 1) x u64 indptr, nnz x u64 indices, nnz x f64 weights
//! ```
//! Area payload: `u64 n` followed by `n x f64`.

use super::sparse::SparseWeights;

pub fn encode_matrices(matrices: &[SparseWeights]) -> Vec<u8> {
    let size: usize = matrices
        .iter()
        .map(|m| 24 + (m.indptr().len() + 2 * m.nnz()) * 8)
        .sum();
    let mut bytes = Vec::with_capacity(4 + size);

    bytes.extend_from_slice(&(matrices.len() as u32).to_le_bytes());
    for m in matrices {
        bytes.extend_from_slice(&(m.n_src() as u64).to_le_bytes());
        bytes.extend_from_slice(&(m.n_dst() as u64).to_le_bytes());
        bytes.extend_from_slice(&(m.nnz() as u64).to_le_bytes());
        for &p in m.indptr() {
            bytes.extend_from_slice(&(p as u64).to_le_bytes());
        }
        for &c in m.indices() {
            bytes.extend_from_slice(&(c as u64).to_le_bytes());
        }
        for &w in m.weights() {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
    }

    bytes
}

pub fn decode_matrices(bytes: &[u8]) -> Result<Vec<SparseWeights>, String> {
    let mut reader = Reader::new(bytes);
    let count = reader.u32()? as usize;
    let mut matrices = Vec::with_capacity(count.min(4096));

    for _ in 0..count {
        let n_src = reader.len()?;
        let n_dst = reader.len()?;
        let nnz = reader.len()?;
        let indptr = reader.usizes(n_dst + 1)?;
        let indices = reader.usizes(nnz)?;
        let weights = reader.f64s(nnz)?;
        matrices.push(SparseWeights::new(n_src, n_dst, indptr, indices, weights)?);
    }

    reader.finish()?;
    Ok(matrices)
}

pub fn encode_areas(areas: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + areas.len() * 8);
    bytes.extend_from_slice(&(areas.len() as u64).to_le_bytes());
    for &a in areas {
        bytes.extend_from_slice(&a.to_le_bytes());
    }
    bytes
}

pub fn decode_areas(bytes: &[u8]) -> Result<Vec<f64>, String> {
    let mut reader = Reader::new(bytes);
    let n = reader.len()?;
    let areas = reader.f64s(n)?;
    reader.finish()?;
    Ok(areas)
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| format!("payload truncated at byte {}", self.offset))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, String> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn len(&mut self) -> Result<usize, String> {
        let v = self.u64()?;
        usize::try_from(v).map_err(|_| format!("length {} does not fit in memory", v))
    }

    fn usizes(&mut self, n: usize) -> Result<Vec<usize>, String> {
        let raw = self.take(n.checked_mul(8).ok_or("length overflow")?)?;
        raw.chunks_exact(8)
            .map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                usize::try_from(u64::from_le_bytes(buf)).map_err(|e| e.to_string())
            })
            .collect()
    }

    fn f64s(&mut self, n: usize) -> Result<Vec<f64>, String> {
        let raw = self.take(n.checked_mul(8).ok_or("length overflow")?)?;
        Ok(raw
            .chunks_exact(8)
            .map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                f64::from_le_bytes(buf)
            })
            .collect())
    }

    fn finish(&self) -> Result<(), String> {
        if self.offset != self.bytes.len() {
            return Err(format!(
                "{} trailing bytes after payload",
                self.bytes.len() - self.offset
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrices_survive_encoding() {
        let a = SparseWeights::from_triplets(3, 2, &[0, 1, 1], &[0, 1, 2], &[1.0, 0.25, 0.75])
            .unwrap();
        let b = SparseWeights::from_triplets(3, 2, &[1], &[2], &[1.0]).unwrap();
        let decoded = decode_matrices(&encode_matrices(&[a.clone(), b.clone()])).unwrap();
        assert_eq!(decoded, vec![a, b]);
        assert_eq!(decoded[1].empty_rows(), &[0]);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let bytes = encode_matrices(&[SparseWeights::identity(4)]);
        assert!(decode_matrices(&bytes[..bytes.len() - 3]).is_err());

        let mut padded = encode_areas(&[1.0, 2.0]);
        padded.push(0);
        assert!(decode_areas(&padded).is_err());
    }

    #[test]
    fn test_huge_count_does_not_allocate() {
        let mut bytes = u32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(decode_matrices(&bytes).is_err());
    }
}
