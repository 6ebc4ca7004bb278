//! Stable device-side radix sort over unsigned keys with an optional
//! payload, `radix_bits` bits per pass.

use std::marker::PhantomData;

use log::debug;
use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use crate::dtype::{is_power_of_two, round_up, ClScalar, SortKey};
use crate::error::{Error, Result};
use crate::program::build_program;
use crate::scan::{PrefixScanProgram, PrefixScanner};

const SRC: &str = include_str!("kernels/radix.cl");

/// Compiled sort kernels for one key/value type pair.
#[derive(Clone)]
pub struct RadixProgram<K: SortKey, V: ClScalar = u32> {
    context: Context,
    program: Program,
    _marker: PhantomData<(K, V)>,
}

impl<K: SortKey, V: ClScalar> RadixProgram<K, V> {
    pub fn new(context: &Context) -> Result<Self> {
        let options = vec![
            format!("-D KEY_TYPE={}", K::DECL),
            format!("-D VALUE_TYPE={}", V::DECL),
        ];
        let program = build_program(context, SRC, &options)?;
        Ok(RadixProgram {
            context: context.clone(),
            program,
            _marker: PhantomData,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Sorts `size` keys (optionally carrying values) in ascending order.
/// Equal keys keep their input order.
pub struct RadixSorter<K: SortKey, V: ClScalar = u32> {
    program: RadixProgram<K, V>,
    scanner: PrefixScanner,
    size: usize,
    group_size: usize,
    radix_bits: u32,
    histogram_buf: Buffer<u32>,
}

impl<K: SortKey, V: ClScalar> RadixSorter<K, V> {
    pub fn new(context: &Context, size: usize, group_size: usize, radix_bits: u32) -> Result<Self> {
        let program = RadixProgram::new(context)?;
        let scan_program = PrefixScanProgram::new(context)?;
        Self::with_programs(program, scan_program, size, group_size, radix_bits)
    }

    pub fn with_programs(
        program: RadixProgram<K, V>,
        scan_program: PrefixScanProgram,
        size: usize,
        group_size: usize,
        radix_bits: u32,
    ) -> Result<Self> {
        check_size::<K>(size, group_size, radix_bits)?;

        let histogram_len = histogram_len(size, group_size, radix_bits);
        let scanner = PrefixScanner::with_program(scan_program, histogram_len, group_size)?;
        let histogram_buf = alloc_histogram(program.context(), histogram_len)?;

        Ok(RadixSorter {
            program,
            scanner,
            size,
            group_size,
            radix_bits,
            histogram_buf,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn radix_bits(&self) -> u32 {
        self.radix_bits
    }

    /// Number of passes over the keys.
    pub fn num_passes(&self) -> u32 {
        K::BITS / self.radix_bits
    }

    fn n_blocks(&self) -> usize {
        self.size / (self.group_size * 2)
    }

    /// Change the sort shape; the sorter is untouched on error.
    pub fn resize(
        &mut self,
        size: Option<usize>,
        group_size: Option<usize>,
        radix_bits: Option<u32>,
    ) -> Result<()> {
        let size = size.unwrap_or(self.size);
        let group_size = group_size.unwrap_or(self.group_size);
        let radix_bits = radix_bits.unwrap_or(self.radix_bits);
        check_size::<K>(size, group_size, radix_bits)?;

        let new_histogram_len = histogram_len(size, group_size, radix_bits);
        let new_histogram = if new_histogram_len != self.histogram_buf.len() {
            debug!("histogram buffer reallocated to {}", new_histogram_len);
            Some(alloc_histogram(self.program.context(), new_histogram_len)?)
        } else {
            None
        };
        self.scanner
            .resize(Some(new_histogram_len), Some(group_size))?;

        if let Some(buf) = new_histogram {
            self.histogram_buf = buf;
        }
        self.size = size;
        self.group_size = group_size;
        self.radix_bits = radix_bits;
        Ok(())
    }

    /// Key-only sort. The sorted keys end up in `out_keys`; `keys` is
    /// clobbered by the intermediate passes.
    pub fn sort(
        &self,
        queue: &Queue,
        keys: &Buffer<K>,
        out_keys: &Buffer<K>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        self.sort_impl(queue, keys, out_keys, None, wait_for)
    }

    /// Key-value sort; values travel with their keys.
    pub fn sort_with_values(
        &self,
        queue: &Queue,
        keys: &Buffer<K>,
        out_keys: &Buffer<K>,
        values: &Buffer<V>,
        out_values: &Buffer<V>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        self.sort_impl(queue, keys, out_keys, Some((values, out_values)), wait_for)
    }

    fn sort_impl(
        &self,
        queue: &Queue,
        keys: &Buffer<K>,
        out_keys: &Buffer<K>,
        values: Option<(&Buffer<V>, &Buffer<V>)>,
        wait_for: Option<&EventList>,
    ) -> Result<Event> {
        if keys.len() < self.size || out_keys.len() < self.size {
            return Err(Error::Argument(format!(
                "key buffers must hold at least {} elements",
                self.size
            )));
        }
        if let Some((values, out_values)) = values {
            if values.len() < self.size || out_values.len() < self.size {
                return Err(Error::Argument(format!(
                    "value buffers must hold at least {} elements",
                    self.size
                )));
            }
        }

        let n_bins = 1usize << self.radix_bits;
        let block = self.group_size * 2;
        let mut wait = match wait_for {
            Some(events) => events.clone(),
            None => EventList::new(),
        };

        let mut last = Event::empty();
        for radix_pass in 0..self.num_passes() {
            let mut clear = Event::empty();
            self.histogram_buf
                .cmd()
                .queue(queue)
                .fill(0u32, None)
                .enew(&mut clear)
                .enq()?;
            wait.push(clear);

            let kernel = Kernel::builder()
                .program(&self.program.program)
                .name("block_sort")
                .queue(queue.clone())
                .global_work_size(self.size / 2)
                .local_work_size(self.group_size)
                .arg(keys)
                .arg(values.map(|(v, _)| v))
                .arg(&self.histogram_buf)
                .arg(self.n_blocks() as u32)
                .arg_local::<K>(block)
                .arg_local::<V>(block)
                .arg_local::<u32>(block)
                .arg_local::<u32>(n_bins)
                .arg(radix_pass)
                .arg(self.radix_bits)
                .build()?;
            let mut sorted = Event::empty();
            unsafe {
                kernel.cmd().ewait(&wait).enew(&mut sorted).enq()?;
            }

            let mut scan_wait = EventList::new();
            scan_wait.push(sorted);
            let scanned = self
                .scanner
                .prefix_sum(queue, &self.histogram_buf, Some(&scan_wait))?;

            let kernel = Kernel::builder()
                .program(&self.program.program)
                .name("scatter")
                .queue(queue.clone())
                .global_work_size(self.size / 2)
                .local_work_size(self.group_size)
                .arg(keys)
                .arg(out_keys)
                .arg(values.map(|(v, _)| v))
                .arg(values.map(|(_, v)| v))
                .arg(&self.histogram_buf)
                .arg(self.n_blocks() as u32)
                .arg_local::<K>(block)
                .arg_local::<u32>(n_bins)
                .arg(radix_pass)
                .arg(self.radix_bits)
                .build()?;
            let mut scattered = Event::empty();
            unsafe {
                kernel.cmd().ewait(&scanned).enew(&mut scattered).enq()?;
            }

            if radix_pass + 1 < self.num_passes() {
                // Feed the next pass: the scattered data becomes its input.
                wait = EventList::new();
                let mut copied = Event::empty();
                out_keys
                    .cmd()
                    .queue(queue)
                    .copy(keys, None, Some(self.size))
                    .ewait(&scattered)
                    .enew(&mut copied)
                    .enq()?;
                wait.push(copied);
                if let Some((values, out_values)) = values {
                    let mut copied = Event::empty();
                    out_values
                        .cmd()
                        .queue(queue)
                        .copy(values, None, Some(self.size))
                        .ewait(&scattered)
                        .enew(&mut copied)
                        .enq()?;
                    wait.push(copied);
                }
            }
            last = scattered;
        }
        Ok(last)
    }
}

fn check_size<K: SortKey>(size: usize, group_size: usize, radix_bits: u32) -> Result<()> {
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
    if radix_bits == 0 || K::BITS % radix_bits != 0 {
        return Err(Error::Config(format!(
            "radix bits ({}) must evenly divide the key width ({})",
            radix_bits,
            K::BITS
        )));
    }
    if 1usize << radix_bits > group_size * 2 {
        return Err(Error::Config(format!(
            "2^radix_bits ({}) must not exceed 2 * group size ({})",
            1usize << radix_bits,
            group_size * 2
        )));
    }
    Ok(())
}

fn histogram_len(size: usize, group_size: usize, radix_bits: u32) -> usize {
    let n_blocks = size / (group_size * 2);
    round_up((1usize << radix_bits) * n_blocks, group_size * 2)
}

fn alloc_histogram(context: &Context, len: usize) -> Result<Buffer<u32>> {
    let buf = Buffer::<u32>::builder()
        .context(context)
        .len(len)
        .flags(ocl::flags::MemFlags::new().read_write().host_no_access())
        .build()?;
    Ok(buf)
}
