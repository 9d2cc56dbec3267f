use parking_lot::RwLock;
use rayon::prelude::*;

/// Element count from which updates are split across the rayon pool.
const PAR_CHUNK: usize = 1 << 14;

/// A single named tensor held by a coordination endpoint, flattened to `f32`s.
#[derive(Debug)]
pub struct Variable {
    values: RwLock<Box<[f32]>>,
}

impl Variable {
    /// Creates a new `Variable` owning a copy of `values`.
    pub fn new(values: &[f32]) -> Self {
        Self {
            values: RwLock::new(values.into()),
        }
    }

    /// Returns the amount of elements of this variable.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Copies the values into `out`, resizing it to fit.
    pub fn read_into(&self, out: &mut Vec<f32>) {
        let values = self.values.read();
        out.clear();
        out.extend_from_slice(&values);
    }

    /// Overwrites the values, the caller must have checked the length.
    pub fn write(&self, values: &[f32]) {
        self.values.write().copy_from_slice(values);
    }

    /// Adds `delta` element-wise, the caller must have checked the length.
    pub fn add(&self, delta: &[f32]) {
        let mut values = self.values.write();

        if values.len() < PAR_CHUNK {
            values.iter_mut().zip(delta).for_each(|(v, d)| *v += d);
            return;
        }

        values
            .par_chunks_mut(PAR_CHUNK)
            .zip(delta.par_chunks(PAR_CHUNK))
            .for_each(|(values, delta)| {
                values.iter_mut().zip(delta).for_each(|(v, d)| *v += d);
            });
    }
}
