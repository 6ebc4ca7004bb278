//! Device-side exclusive prefix sum.
//!
//! The scanner owns one buffer per recursion level: block totals of the
//! input, block totals of those totals, and so on until a single work-group
//! covers a level. Scanning runs down the ladder and the scanned totals are
//! then added back up.

use log::debug;
use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use crate::dtype::{is_power_of_two, round_up};
use crate::error::{Error, Result};
use crate::program::build_program;

const SRC: &str = include_str!("kernels/scan.cl");

/// Compiled scan kernels, shareable between scanners on one context.
#[derive(Clone)]
pub struct PrefixScanProgram {
    context: Context,
    program: Program,
}

impl PrefixScanProgram {
    pub fn new(context: &Context) -> Result<Self> {
        let program = build_program(context, SRC, &[])?;
        Ok(PrefixScanProgram {
            context: context.clone(),
            program,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Exclusive prefix sum over `u32` arrays whose length is a multiple of
/// twice the work-group size.
pub struct PrefixScanner {
    program: PrefixScanProgram,
    size: usize,
    group_size: usize,
    block_sums_bufs: Vec<Buffer<u32>>,
}

impl PrefixScanner {
    pub fn new(context: &Context, size: usize, group_size: usize) -> Result<Self> {
        let program = PrefixScanProgram::new(context)?;
        Self::with_program(program, size, group_size)
    }

    pub fn with_program(program: PrefixScanProgram, size: usize, group_size: usize) -> Result<Self> {
        check_size(size, group_size)?;
        let block_sums_bufs = block_lengths(size, group_size)
            .iter()
            .map(|&len| alloc_block_sums(program.context(), len))
            .collect::<Result<Vec<_>>>()?;

        Ok(PrefixScanner {
            program,
            size,
            group_size,
            block_sums_bufs,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Change the input length or group size. Level buffers whose length is
    /// unchanged are kept; the scanner is untouched on error.
    pub fn resize(&mut self, size: Option<usize>, group_size: Option<usize>) -> Result<()> {
        let size = size.unwrap_or(self.size);
        let group_size = group_size.unwrap_or(self.group_size);
        check_size(size, group_size)?;

        let new_lengths = block_lengths(size, group_size);
        let mut new_bufs = Vec::with_capacity(new_lengths.len());
        for (level, &len) in new_lengths.iter().enumerate() {
            match self.block_sums_bufs.get(level) {
                Some(old) if old.len() == len => new_bufs.push(old.clone()),
                _ => {
                    debug!("scan level {} buffer reallocated to {}", level, len);
                    new_bufs.push(alloc_block_sums(self.program.context(), len)?);
                }
            }
        }

        self.size = size;
        self.group_size = group_size;
        self.block_sums_bufs = new_bufs;
        Ok(())
    }

    /// Replace `values[0..size]` with its exclusive prefix sum.
    pub fn prefix_sum(
        &self,
        queue: &Queue,
        values: &Buffer<u32>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        let group_size = self.group_size;
        let block = group_size * 2;

        // Down the ladder: scan each level, capturing block totals.
        let mut events = match wait_for {
            Some(wait) => wait.clone(),
            None => EventList::new(),
        };
        let mut event = self.enqueue_local_scan(
            queue,
            self.size / 2,
            group_size,
            block,
            values,
            Some(&self.block_sums_bufs[0]),
            &events,
        )?;

        for level in 0..self.block_sums_bufs.len() - 1 {
            let level_len = self.block_sums_bufs[level].len();
            events = EventList::new();
            events.push(event);
            event = self.enqueue_local_scan(
                queue,
                level_len / 2,
                group_size,
                block,
                &self.block_sums_bufs[level],
                Some(&self.block_sums_bufs[level + 1]),
                &events,
            )?;
        }

        // The topmost level fits a single work-group.
        let top = self.block_sums_bufs.last().expect("at least one level");
        let top_len = top.len();
        events = EventList::new();
        events.push(event);
        event = self.enqueue_local_scan(
            queue,
            top_len / 2,
            top_len / 2,
            top_len,
            top,
            None,
            &events,
        )?;

        // Back up the ladder: add scanned block totals to each level.
        for level in (0..self.block_sums_bufs.len() - 1).rev() {
            let level_len = self.block_sums_bufs[level].len();
            event = self.enqueue_block_scan(
                queue,
                level_len / 2,
                group_size,
                &self.block_sums_bufs[level],
                &self.block_sums_bufs[level + 1],
                &event,
            )?;
        }

        self.enqueue_block_scan(
            queue,
            self.size / 2,
            group_size,
            values,
            &self.block_sums_bufs[0],
            &event,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_local_scan(
        &self,
        queue: &Queue,
        global_size: usize,
        local_size: usize,
        cache_len: usize,
        values: &Buffer<u32>,
        block_sums: Option<&Buffer<u32>>,
        wait: &EventList,
    ) -> Result<Event> {
        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("local_scan")
            .queue(queue.clone())
            .global_work_size(global_size)
            .local_work_size(local_size)
            .arg(values)
            .arg_local::<u32>(cache_len)
            .arg(block_sums)
            .build()?;

        let mut event = Event::empty();
        unsafe {
            kernel.cmd().ewait(wait).enew(&mut event).enq()?;
        }
        Ok(event)
    }

    fn enqueue_block_scan(
        &self,
        queue: &Queue,
        global_size: usize,
        local_size: usize,
        values: &Buffer<u32>,
        block_sums: &Buffer<u32>,
        wait: &Event,
    ) -> Result<Event> {
        let kernel = Kernel::builder()
            .program(&self.program.program)
            .name("block_scan")
            .queue(queue.clone())
            .global_work_size(global_size)
            .local_work_size(local_size)
            .arg(values)
            .arg(block_sums)
            .build()?;

        let mut event = Event::empty();
        unsafe {
            kernel.cmd().ewait(wait).enew(&mut event).enq()?;
        }
        Ok(event)
    }
}

fn check_size(size: usize, group_size: usize) -> Result<()> {
    if !is_power_of_two(group_size) {
        return Err(Error::Config(format!(
            "group size ({}) must be a power of two",
            group_size
        )));
    }
    if size == 0 || size % (group_size * 2) != 0 {
        return Err(Error::Config(format!(
            "size ({}) must be a multiple of 2 * group size ({})",
            size, group_size
        )));
    }
    Ok(())
}

/// Lengths of the block-sum buffers, one per recursion level. The last
/// level is rounded up to a power of two so a single work-group scan
/// finishes the ladder.
fn block_lengths(size: usize, group_size: usize) -> Vec<usize> {
    let block = group_size * 2;
    let mut lengths = Vec::new();
    let mut len = round_up(ceil_div(size, block), block);
    while len > block {
        len = round_up(len, block);
        lengths.push(len);
        len = ceil_div(len, block);
    }
    lengths.push(len.next_power_of_two());
    lengths
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

fn alloc_block_sums(context: &Context, len: usize) -> Result<Buffer<u32>> {
    let buf = Buffer::<u32>::builder()
        .context(context)
        .len(len)
        .flags(ocl::flags::MemFlags::new().read_write().host_no_access())
        .build()?;
    Ok(buf)
}
