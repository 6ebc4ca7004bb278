//! Shared helper for compiling kernel programs with `-D` type injection.

use log::debug;
use ocl::{Context, Program};

use crate::error::Result;

/// Build an OpenCL program from source for every device in the context.
pub(crate) fn build_program(context: &Context, src: &str, options: &[String]) -> Result<Program> {
    let opts = options.join(" ");
    debug!("building program with options: {:?}", opts);

    let program = Program::builder()
        .src(src)
        .cmplr_opt(opts)
        .build(context)?;
    Ok(program)
}

/// Assemble the `-D` option list for a kernel element type.
pub(crate) fn dtype_options(name: &str, decl: &str, needs_fp64: bool) -> Vec<String> {
    let mut options = vec![format!("-D {}={}", name, decl)];
    if needs_fp64 {
        options.push("-D DTYPE_DOUBLE".to_string());
    }
    options
}
