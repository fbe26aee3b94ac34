use std::fmt;
use std::ops::{Deref, Range};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use rand_distr::StandardNormal;

use crate::context::Context;
use crate::engine::{Engine, Var};
use crate::bail;
use crate::error::{Error, Result};
use crate::ops::{self, BinaryOp, ScalarOp};
use crate::shape::Shape;

// Array — Asynchronous n-dimensional array handle
//
// An Array is a view (shape + element offset) onto a reference-counted storage
// Chunk. Nothing reads or writes a chunk directly: every access is an engine
// operation submitted through `ops::launch`, and the host only observes data
// after waiting on the chunk's engine variable.
//
// MEMORY MODEL:
//
//   Array ──Arc──► Chunk { var, context, RwLock<Vec<f32>>, capacity }
//
//   Cloning an Array shares the chunk; `deep_copy` is the data copy.
//   `reshape` and `slice` return views over the same chunk. Views are always
//   contiguous row-major ranges of the chunk.
//
//   A chunk created with delayed allocation keeps an empty buffer until the
//   first operation touches it. Dropping the last handle deletes the engine
//   variable; the engine forgets it once pending operations have finished.
//
// NONE STATE:
//
//   An Array without a chunk has no shape and no storage. Queries answer with
//   an empty shape and the zero context; anything that needs data fails with
//   Error::NoneArray.

/// Storage block shared by every view of an array.
pub struct Chunk {
    var: Var,
    engine: Engine,
    context: Context,
    capacity: usize,
    delay_alloc: bool,
    data: RwLock<Vec<f32>>,
}

impl Chunk {
    fn new(capacity: usize, context: Context, delay_alloc: bool, engine: &Engine) -> Self {
        let data = if delay_alloc {
            Vec::new()
        } else {
            vec![0.0; capacity]
        };
        Self::with_data(data, capacity, context, delay_alloc, engine)
    }

    fn with_data(
        data: Vec<f32>,
        capacity: usize,
        context: Context,
        delay_alloc: bool,
        engine: &Engine,
    ) -> Self {
        Chunk {
            var: engine.new_variable(),
            engine: engine.clone(),
            context,
            capacity,
            delay_alloc,
            data: RwLock::new(data),
        }
    }

    pub fn var(&self) -> Var {
        self.var
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn context(&self) -> Context {
        self.context
    }

    /// Allocate a delayed buffer if nothing has touched it yet.
    fn ensure_allocated(&self) -> Result<()> {
        let allocated = self
            .data
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))?
            .len()
            == self.capacity;
        if !allocated {
            let mut data = self
                .data
                .write()
                .map_err(|_| Error::msg("storage lock poisoned"))?;
            data.resize(self.capacity, 0.0);
        }
        Ok(())
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<f32>>> {
        self.ensure_allocated()?;
        self.data
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<f32>>> {
        let mut data = self
            .data
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))?;
        if data.len() != self.capacity {
            data.resize(self.capacity, 0.0);
        }
        Ok(data)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.engine.delete_variable(self.var);
    }
}

/// Read access to the host data of an array, valid while held.
pub struct HostData<'a> {
    guard: RwLockReadGuard<'a, Vec<f32>>,
    range: Range<usize>,
}

impl Deref for HostData<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.guard[self.range.clone()]
    }
}

/// Handle to an n-dimensional f32 array whose operations run on an [`Engine`].
///
/// `clone()` shares storage. Use [`Array::deep_copy`] for an independent copy.
#[derive(Clone, Default)]
pub struct Array {
    chunk: Option<Arc<Chunk>>,
    shape: Shape,
    offset: usize,
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chunk {
            None => write!(f, "Array(none)"),
            Some(chunk) => write!(
                f,
                "Array(shape={}, context={}, var={:?}, offset={})",
                self.shape, chunk.context, chunk.var, self.offset
            ),
        }
    }
}

impl Array {
    // Construction

    /// Create an array of `shape` on `context`.
    ///
    /// An empty shape gives a none-state array. With `delay_alloc` the buffer is
    /// allocated by the first operation that touches it.
    pub fn new(shape: impl Into<Shape>, context: Context, delay_alloc: bool, engine: &Engine) -> Self {
        let shape = shape.into();
        if shape.is_none() {
            return Array::none();
        }
        let chunk = Chunk::new(shape.size(), context, delay_alloc, engine);
        Array {
            chunk: Some(Arc::new(chunk)),
            shape,
            offset: 0,
        }
    }

    /// Array with no shape and no storage.
    pub fn none() -> Self {
        Array::default()
    }

    /// Host array adopting `data`, which must hold exactly `shape.size()` values.
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>, engine: &Engine) -> Result<Self> {
        let shape = shape.into();
        if shape.is_none() {
            return Err(Error::NoneArray("cannot adopt a buffer without a shape".into()));
        }
        if data.len() != shape.size() {
            return Err(Error::SizeMismatch {
                expected: shape.size(),
                got: data.len(),
            });
        }
        let capacity = data.len();
        let chunk = Chunk::with_data(data, capacity, Context::cpu(), false, engine);
        Ok(Array {
            chunk: Some(Arc::new(chunk)),
            shape,
            offset: 0,
        })
    }

    /// Array of `shape` on the same context and engine as `self`.
    pub fn empty_like(&self, shape: impl Into<Shape>) -> Result<Self> {
        let chunk = self.require("empty_like")?;
        Ok(Array::new(shape, chunk.context, false, &chunk.engine))
    }

    // Queries

    /// Shape of the array. Empty for none-state arrays.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Context of the storage. The zero context for none-state arrays.
    pub fn context(&self) -> Context {
        self.chunk.as_ref().map(|c| c.context).unwrap_or_default()
    }

    pub fn is_none(&self) -> bool {
        self.chunk.is_none()
    }

    /// Number of elements in this view.
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Whether the storage was created with delayed allocation.
    pub fn is_delayed(&self) -> bool {
        self.chunk.as_ref().is_some_and(|c| c.delay_alloc)
    }

    /// Engine the storage is scheduled on.
    pub fn engine(&self) -> Option<&Engine> {
        self.chunk.as_ref().map(|c| &c.engine)
    }

    /// Engine variable of the storage.
    pub fn var(&self) -> Option<Var> {
        self.chunk.as_ref().map(|c| c.var)
    }

    /// Whether two arrays are views of the same storage.
    pub fn shares_storage(&self, other: &Array) -> bool {
        match (&self.chunk, &other.chunk) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn chunk(&self) -> Option<&Arc<Chunk>> {
        self.chunk.as_ref()
    }

    pub(crate) fn storage_range(&self) -> Range<usize> {
        self.offset..self.offset + self.shape.size()
    }

    fn require(&self, what: &str) -> Result<&Arc<Chunk>> {
        self.chunk
            .as_ref()
            .ok_or_else(|| Error::NoneArray(format!("{what} needs storage")))
    }

    // Synchronization

    /// Block until every pending write to this array's storage has finished.
    pub fn wait_to_read(&self) -> Result<()> {
        match &self.chunk {
            Some(chunk) => chunk.engine.wait_to_read(chunk.var),
            None => Ok(()),
        }
    }

    /// Block until every pending read and write of this array's storage has finished.
    pub fn wait_to_write(&self) -> Result<()> {
        match &self.chunk {
            Some(chunk) => chunk.engine.wait_to_write(chunk.var),
            None => Ok(()),
        }
    }

    // Host transfer

    /// Copy `data` into the array and wait for the copy to land.
    pub fn sync_copy_from_cpu(&self, data: &[f32]) -> Result<()> {
        self.require("sync_copy_from_cpu")?;
        if data.len() != self.size() {
            return Err(Error::SizeMismatch {
                expected: self.size(),
                got: data.len(),
            });
        }
        let src = data.to_vec();
        ops::launch("sync_copy_from_cpu", &[], &[self], move |_, out| {
            out[0].copy_from_slice(&src);
            Ok(())
        })?;
        self.wait_to_read()
    }

    /// Wait for pending writes, then copy the array into `out`.
    pub fn sync_copy_to_cpu(&self, out: &mut [f32]) -> Result<()> {
        let chunk = self.require("sync_copy_to_cpu")?;
        if out.len() != self.size() {
            return Err(Error::SizeMismatch {
                expected: self.size(),
                got: out.len(),
            });
        }
        self.wait_to_read()?;
        let data = chunk.read()?;
        out.copy_from_slice(&data[self.storage_range()]);
        Ok(())
    }

    /// Wait for pending writes and return the array contents.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.size()];
        self.sync_copy_to_cpu(&mut out)?;
        Ok(out)
    }

    /// Borrow the raw host data after waiting for pending writes.
    ///
    /// `Ok(None)` for a none-state array, `Err(NotHostMemory)` unless the
    /// array lives in host memory. Holding the guard delays engine writes to
    /// the storage, so drop it before waiting on anything.
    pub fn host_data(&self) -> Result<Option<HostData<'_>>> {
        let Some(chunk) = &self.chunk else {
            return Ok(None);
        };
        if !chunk.context.is_host() {
            return Err(Error::NotHostMemory {
                context: chunk.context,
            });
        }
        self.wait_to_read()?;
        Ok(Some(HostData {
            guard: chunk.read()?,
            range: self.storage_range(),
        }))
    }

    // Views and copies

    /// Independent array with the same shape, context and (eventually) data.
    pub fn deep_copy(&self) -> Result<Array> {
        let Some(chunk) = &self.chunk else {
            return Ok(Array::none());
        };
        let out = Array::new(self.shape.clone(), chunk.context, false, &chunk.engine);
        out.copy_from(self)?;
        Ok(out)
    }

    /// Schedule a copy of `src` into this array. Shapes must match.
    pub fn copy_from(&self, src: &Array) -> Result<()> {
        self.require("copy_from")?;
        src.require("copy_from")?;
        if src.shape != self.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: src.shape.clone(),
            });
        }
        if self.shares_storage(src) && self.offset == src.offset {
            return Ok(());
        }
        ops::launch("copyto", &[src], &[self], |inp, out| {
            out[0].copy_from_slice(inp[0]);
            Ok(())
        })
    }

    /// View of the same storage with a new shape of equal size.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Array> {
        let shape = shape.into();
        self.require("reshape")?;
        if shape.size() != self.size() || shape.is_none() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: shape,
            });
        }
        Ok(Array {
            chunk: self.chunk.clone(),
            shape,
            offset: self.offset,
        })
    }

    /// View of rows `begin..end` along the first dimension.
    pub fn slice(&self, begin: usize, end: usize) -> Result<Array> {
        self.require("slice")?;
        let rows = self.shape.dim(0)?;
        if begin > end || end > rows {
            bail!("slice {begin}..{end} out of range for shape {}", self.shape);
        }
        let (_, row_size) = self.shape.flat_2d();
        let mut dims = self.shape.dims().to_vec();
        dims[0] = end - begin;
        Ok(Array {
            chunk: self.chunk.clone(),
            shape: Shape::new(dims),
            offset: self.offset + begin * row_size,
        })
    }

    // Arithmetic

    /// `self <op> rhs` into a new array.
    pub fn binary(&self, rhs: &Array, op: BinaryOp) -> Result<Array> {
        let out = self.empty_like(self.shape.clone())?;
        self.binary_into(rhs, op, &out)?;
        Ok(out)
    }

    /// `out = self <op> rhs`. `out` may be `self` or `rhs`.
    pub fn binary_into(&self, rhs: &Array, op: BinaryOp, out: &Array) -> Result<()> {
        for other in [rhs, out] {
            if other.shape != self.shape {
                return Err(Error::ShapeMismatch {
                    expected: self.shape.clone(),
                    got: other.shape.clone(),
                });
            }
        }
        ops::launch(op.name(), &[self, rhs], &[out], move |inp, out| {
            for ((o, &a), &b) in out[0].iter_mut().zip(inp[0]).zip(inp[1]) {
                *o = op.apply(a, b);
            }
            Ok(())
        })
    }

    /// `self <op> scalar` into a new array.
    pub fn scalar(&self, op: ScalarOp, value: f32) -> Result<Array> {
        let out = self.empty_like(self.shape.clone())?;
        ops::launch(op.name(), &[self], &[&out], move |inp, out| {
            for (o, &a) in out[0].iter_mut().zip(inp[0]) {
                *o = op.apply(a, value);
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: f32) -> Result<()> {
        ops::launch("set_value", &[], &[self], move |_, out| {
            out[0].fill(value);
            Ok(())
        })
    }

    /// Fill with samples from U(low, high).
    pub fn random_uniform(&self, low: f32, high: f32) -> Result<()> {
        if !(low < high) {
            bail!("random_uniform needs low < high, got {low} and {high}");
        }
        ops::launch("random_uniform", &[], &[self], move |_, out| {
            let mut rng = rand::thread_rng();
            for o in out[0].iter_mut() {
                *o = rng.gen_range(low..high);
            }
            Ok(())
        })
    }

    /// Fill with samples from N(mean, std²).
    pub fn random_gaussian(&self, mean: f32, std: f32) -> Result<()> {
        ops::launch("random_gaussian", &[], &[self], move |_, out| {
            let mut rng = rand::thread_rng();
            for o in out[0].iter_mut() {
                *o = mean + std * rng.sample::<f32, _>(StandardNormal);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::synchronous().unwrap()
    }

    #[test]
    fn test_none_state_queries() {
        let a = Array::none();
        assert_eq!(a.shape().ndim(), 0);
        assert_eq!(a.context(), Context::default());
        assert!(a.host_data().unwrap().is_none());
        assert!(a.wait_to_read().is_ok());
        assert!(matches!(a.to_vec(), Err(Error::NoneArray(_))));
    }

    #[test]
    fn test_empty_shape_is_none() {
        let a = Array::new(Shape::none(), Context::cpu(), false, &engine());
        assert!(a.is_none());
    }

    #[test]
    fn test_delayed_allocation_reads_zeros() {
        let e = engine();
        let a = Array::new((2, 2), Context::cpu(), true, &e);
        assert!(a.is_delayed());
        assert_eq!(a.to_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_views_share_storage() {
        let e = engine();
        let a = Array::from_vec((0..6).map(|x| x as f32).collect(), (3, 2), &e).unwrap();
        let rows = a.slice(1, 3).unwrap();
        assert_eq!(rows.shape(), &Shape::from((2, 2)));
        assert_eq!(rows.to_vec().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
        rows.fill(9.0).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![0.0, 1.0, 9.0, 9.0, 9.0, 9.0]);

        let flat = a.reshape(6).unwrap();
        assert!(flat.shares_storage(&a));
        assert!(a.reshape(5).is_err());
        assert!(matches!(a.slice(2, 4), Err(Error::Msg(_))));
        assert!(matches!(a.random_uniform(1.0, 1.0), Err(Error::Msg(_))));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let e = engine();
        let a = Array::from_vec(vec![1.0, 2.0], 2, &e).unwrap();
        let b = a.deep_copy().unwrap();
        a.fill(0.0).unwrap();
        assert_eq!(b.to_vec().unwrap(), vec![1.0, 2.0]);
        assert!(!b.shares_storage(&a));
    }

    #[test]
    fn test_binary_in_place() {
        let e = engine();
        let a = Array::from_vec(vec![1.0, 2.0, 3.0], 3, &e).unwrap();
        let b = Array::from_vec(vec![10.0, 20.0, 30.0], 3, &e).unwrap();
        a.binary_into(&b, BinaryOp::Add, &a).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![11.0, 22.0, 33.0]);
        let c = a.scalar(ScalarOp::Rsub, 1.0).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![-10.0, -21.0, -32.0]);
    }

    #[test]
    fn test_size_mismatch() {
        let e = engine();
        let a = Array::new(3, Context::cpu(), false, &e);
        assert!(matches!(
            a.sync_copy_from_cpu(&[1.0, 2.0]),
            Err(Error::SizeMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_non_host_data_is_rejected() {
        let e = engine();
        let a = Array::new((2, 2), Context::gpu(0), false, &e);
        assert!(matches!(a.host_data(), Err(Error::NotHostMemory { .. })));
        // Host transfers still work.
        a.sync_copy_from_cpu(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dropping_array_releases_variable() {
        let e = engine();
        {
            let _a = Array::new(4, Context::cpu(), false, &e);
            assert_eq!(e.num_variables(), 1);
        }
        assert_eq!(e.num_variables(), 0);
    }
}
