//! Gather/scatter of typed device arrays through an index buffer.
//!
//! Useful around the sorter: applying a sorted permutation to payload
//! arrays, or undoing one.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use crate::dtype::{ClType, SortKey};
use crate::error::{Error, Result};
use crate::program::build_program;

const SRC: &str = include_str!("kernels/index.cl");

/// Compiled gather/scatter kernels for one value/index type pair.
#[derive(Clone)]
pub struct IndexProgram<V: ClType, I: SortKey> {
    context: Context,
    program: Program,
    _marker: PhantomData<(V, I)>,
}

impl<V: ClType, I: SortKey> IndexProgram<V, I> {
    pub fn new(context: &Context) -> Result<Self> {
        let mut options = vec![
            format!("-D VALUE_TYPE={}", V::DECL),
            format!("-D INDEX_TYPE={}", I::DECL),
        ];
        if V::NEEDS_FP64 {
            options.push("-D DTYPE_DOUBLE".into());
        }
        let program = build_program(context, SRC, &options)?;
        Ok(IndexProgram {
            context: context.clone(),
            program,
            _marker: PhantomData,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Applies an index buffer to value arrays, in either direction.
pub struct Indexer<V: ClType, I: SortKey = u32> {
    program: IndexProgram<V, I>,
}

impl<V: ClType, I: SortKey> Indexer<V, I> {
    pub fn new(context: &Context) -> Result<Self> {
        let program = IndexProgram::new(context)?;
        Ok(Indexer { program })
    }

    pub fn with_program(program: IndexProgram<V, I>) -> Self {
        Indexer { program }
    }

    /// `out[i] = values[indices[i]]` for `i` in `0..n`.
    pub fn gather(
        &self,
        queue: &Queue,
        n: usize,
        values: &Buffer<V>,
        indices: &Buffer<I>,
        out: &Buffer<V>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        self.enqueue("gather", queue, n, values, indices, out, wait_for)
    }

    /// `out[indices[i]] = values[i]` for `i` in `0..n`. Indices must be
    /// unique or the result is race-determined.
    pub fn scatter(
        &self,
        queue: &Queue,
        n: usize,
        values: &Buffer<V>,
        indices: &Buffer<I>,
        out: &Buffer<V>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        self.enqueue("scatter", queue, n, values, indices, out, wait_for)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &self,
        name: &str,
        queue: &Queue,
        n: usize,
        values: &Buffer<V>,
        indices: &Buffer<I>,
        out: &Buffer<V>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        if n == 0 {
            return Err(Error::Argument("index count must be positive".into()));
        }
        if indices.len() < n {
            return Err(Error::Argument(format!(
                "index buffer must hold {} entries",
                n
            )));
        }

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name(name)
            .queue(queue.clone())
            .global_work_size(n)
            .arg(values)
            .arg(indices)
            .arg(out)
            .build()?;
        let mut event = Event::empty();
        let mut cmd = kernel.cmd().enew(&mut event);
        if let Some(wait) = wait_for {
            cmd = cmd.ewait(wait);
        }
        unsafe {
            cmd.enq()?;
        }
        Ok(event)
    }
}
