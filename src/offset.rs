//! Bucket offsets of an ascending device array: for every value `v` below
//! a bound, the index of the first element `>= v`. Turns sorted keys or
//! cell ids into an offset table.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use crate::dtype::SortKey;
use crate::error::{Error, Result};
use crate::program::build_program;

const SRC: &str = include_str!("kernels/offset.cl");

/// Compiled offset kernel for one value/offset type pair.
#[derive(Clone)]
pub struct OffsetProgram<V: SortKey, O: SortKey> {
    context: Context,
    program: Program,
    _marker: PhantomData<(V, O)>,
}

impl<V: SortKey, O: SortKey> OffsetProgram<V, O> {
    pub fn new(context: &Context) -> Result<Self> {
        let options = vec![
            format!("-D VALUE_TYPE={}", V::DECL),
            format!("-D OFFSET_TYPE={}", O::DECL),
        ];
        let program = build_program(context, SRC, &options)?;
        Ok(OffsetProgram {
            context: context.clone(),
            program,
            _marker: PhantomData,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Finds bucket start offsets in an ascending array.
pub struct OffsetFinder<V: SortKey, O: SortKey = u32> {
    program: OffsetProgram<V, O>,
}

impl<V: SortKey, O: SortKey> OffsetFinder<V, O> {
    pub fn new(context: &Context) -> Result<Self> {
        let program = OffsetProgram::new(context)?;
        Ok(OffsetFinder { program })
    }

    pub fn with_program(program: OffsetProgram<V, O>) -> Self {
        OffsetFinder { program }
    }

    /// Fill `offsets[v]` with the index of the first element of
    /// `values[0..n_values]` that is `>= v`, for `v` in `0..n_offsets`.
    /// Values past every element are not written; prefill the offset
    /// buffer with `n_values` if those entries matter.
    pub fn find_offsets(
        &self,
        queue: &Queue,
        values: &Buffer<V>,
        n_values: usize,
        offsets: &Buffer<O>,
        n_offsets: V,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        if n_values < 2 {
            return Err(Error::Argument(
                "offset search needs at least two values".into(),
            ));
        }
        if values.len() < n_values {
            return Err(Error::Argument(format!(
                "value buffer must hold {} entries",
                n_values
            )));
        }

        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("find_offsets")
            .queue(queue.clone())
            .global_work_size(n_values - 1)
            .arg(values)
            .arg(offsets)
            .arg(n_offsets)
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
