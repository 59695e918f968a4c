use super::super::args::*;
use crate::exit_codes::SUCCESS;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Verify(args) => super::verify::run(args).await,
        Command::Match(args) => super::matching::run(args),
        Command::Providers(args) => Ok(super::providers::run(args)),
        Command::Recipe(args) => match args.cmd {
            RecipeSub::Run(run_args) => super::recipe::run(run_args).await,
        },
        Command::Keys(args) => match args.cmd {
            KeysSub::Today(today_args) => super::keys::today(today_args).await,
        },
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(SUCCESS)
        }
    }
}
