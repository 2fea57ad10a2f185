use dfdx::prelude::*;

use crate::error::Error;

/// A rectangular batch of token indices, laid out row-major as `(batch, seq_len)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    ids: Vec<usize>,
    batch: usize,
    seq_len: usize,
}

impl TokenBatch {
    pub fn new(rows: Vec<Vec<usize>>) -> Result<Self, Error> {
        let seq_len = rows.first().map(Vec::len).ok_or(Error::EmptyBatch)?;
        if seq_len == 0 {
            return Err(Error::EmptyBatch);
        }
        if let Some((row, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != seq_len) {
            return Err(Error::RaggedBatch {
                row,
                expected: seq_len,
                got: r.len(),
            });
        }
        Ok(Self {
            batch: rows.len(),
            seq_len,
            ids: rows.into_iter().flatten().collect(),
        })
    }

    pub fn from_flat(ids: Vec<usize>, batch: usize, seq_len: usize) -> Result<Self, Error> {
        if batch == 0 || seq_len == 0 {
            return Err(Error::EmptyBatch);
        }
        if ids.len() != batch * seq_len {
            return Err(Error::shape("token batch", &[batch * seq_len], &[ids.len()]));
        }
        Ok(Self {
            ids,
            batch,
            seq_len,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    /// Row `b`, or `None` past the last row.
    pub fn row(&self, b: usize) -> Option<&[usize]> {
        self.rows().nth(b)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[usize]> + '_ {
        self.ids.chunks(self.seq_len)
    }

    /// Drops the last column, e.g. to feed a target sequence shifted for teacher forcing.
    pub fn without_last(&self) -> Result<Self, Error> {
        if self.seq_len < 2 {
            return Err(Error::EmptyBatch);
        }
        let ids = self
            .ids
            .chunks(self.seq_len)
            .flat_map(|row| row[..self.seq_len - 1].iter().copied())
            .collect();
        Ok(Self {
            ids,
            batch: self.batch,
            seq_len: self.seq_len - 1,
        })
    }

    /// Keeps only the last `len` columns.
    pub fn last_columns(&self, len: usize) -> Self {
        let start = self.seq_len.saturating_sub(len.max(1));
        let ids = self
            .ids
            .chunks(self.seq_len)
            .flat_map(|row| row[start..].iter().copied())
            .collect();
        Self {
            ids,
            batch: self.batch,
            seq_len: self.seq_len - start,
        }
    }

    /// Fails on the first index that is not below `vocab_size`.
    pub fn check_vocab(&self, vocab_size: usize) -> Result<(), Error> {
        match self.ids.iter().position(|&t| t >= vocab_size) {
            Some(position) => Err(Error::TokenOutOfRange {
                token: self.ids[position],
                position,
                vocab_size,
            }),
            None => Ok(()),
        }
    }

    /// Position indices `0..seq_len` repeated for every row.
    pub fn positions(&self) -> Vec<usize> {
        (0..self.batch).flat_map(|_| 0..self.seq_len).collect()
    }

    pub fn try_to_device<D: Device<f32>>(
        &self,
        dev: &D,
    ) -> Result<Tensor<(usize, usize), usize, D>, D::Err> {
        dev.try_tensor_from_vec(self.ids.clone(), (self.batch, self.seq_len))
    }
}
