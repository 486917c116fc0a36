use anyhow::Result;
use clap::Parser;
use log::info;
use std::fmt::Write;
use std::io;

use air_codegen::codegen::{CodegenOptions, LinalgCodegen};
use air_codegen::common::{DimSize, Dtype};
use air_codegen::ir::Module;
use air_codegen::kernel::{kernel_function, matmul_function, KernelKind};
use air_codegen::pprint::print_report;
use air_codegen::utils::ToWriteFmt;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    options: CodegenOptions,

    /// Element type of every buffer
    #[arg(long, value_enum, default_value_t = Dtype::Sint32)]
    dtype: Dtype,

    /// Also print the input module
    #[arg(long)]
    print_input: bool,

    #[command(subcommand)]
    kernel: KernelQuery,
}

#[derive(clap::Subcommand)]
enum KernelQuery {
    #[command(about = "Lower a matrix multiplication")]
    Matmul {
        m: DimSize,
        /// Defaults to M
        n: Option<DimSize>,
        /// Defaults to M
        k: Option<DimSize>,
    },
    #[command(about = "Lower an NCHW convolution")]
    Conv {
        #[arg(long, short, default_value = "1")]
        batch: DimSize,
        #[arg(long, default_value = "16")]
        channels: DimSize,
        #[arg(long, default_value = "32")]
        filters: DimSize,
        #[arg(long, default_value = "3")]
        filters_size: DimSize,
        size: DimSize,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let func = match args.kernel {
        KernelQuery::Matmul { m, n, k } => {
            matmul_function("forward", m, n.unwrap_or(m), k.unwrap_or(m), args.dtype)
        }
        KernelQuery::Conv {
            batch,
            channels,
            filters,
            filters_size,
            size,
        } => {
            anyhow::ensure!(
                filters_size <= size,
                "filters ({filters_size}) larger than the image ({size})"
            );
            let out = size - filters_size + 1;
            kernel_function(
                "forward",
                KernelKind::Conv2dNchw,
                [
                    &[batch, channels, size, size],
                    &[filters, channels, filters_size, filters_size],
                    &[batch, filters, out, out],
                ],
                args.dtype,
            )
        }
    };
    let mut module = Module::new();
    module.add_function(func);

    let mut stdout = ToWriteFmt(io::stdout());
    if args.print_input {
        writeln!(stdout, "{module}")?;
    }

    let start_time = std::time::Instant::now();
    let report = LinalgCodegen::new(args.options).run(&mut module)?;
    info!("codegen took {:?}", start_time.elapsed());

    writeln!(stdout, "{module}")?;
    print_report(&report);
    Ok(())
}
