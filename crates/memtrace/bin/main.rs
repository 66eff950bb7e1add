mod cmd;
use clap::{Parser, Subcommand};
use cmd::compare::CompareArgs;
use cmd::show::ShowArgs;
use eyre::Result;

#[derive(Subcommand, Debug)]
pub enum MTSubcommand {
    #[command(about = "Render a JSON leak report")]
    Show(ShowArgs),
    #[command(about = "Compare two JSON leak reports stack by stack")]
    Compare(CompareArgs),
}

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "memtrace CLI: inspect and compare leak reports written with MEMTRACE_FORMAT=json

https://github.com/pawurb/memtrace"
)]
pub struct MTArgs {
    #[command(subcommand)]
    pub cmd: MTSubcommand,
}

fn main() -> Result<()> {
    let root_args = MTArgs::parse();

    match root_args.cmd {
        MTSubcommand::Show(args) => {
            args.run()?;
        }
        MTSubcommand::Compare(args) => {
            args.run()?;
        }
    }

    Ok(())
}
