use keytrace_core::{FetchOptions, FetcherSet, KeytraceConfig, Recipe, RecipeRunner};

use crate::cli::args::RecipeRunArgs;
use crate::exit_codes::{NOT_VERIFIED, SUCCESS};

pub async fn run(args: RecipeRunArgs) -> anyhow::Result<i32> {
    let recipe = Recipe::from_file(&args.file).await?;
    let config = KeytraceConfig::from_env();

    let mut bindings = match args.uri.as_deref() {
        Some(uri) => recipe.bindings_for(&args.claim_id, &args.did, uri),
        None => keytrace_core::Bindings::for_claim(&args.claim_id, &args.did),
    };
    for (key, value) in args.params {
        bindings = bindings.with(key, value);
    }

    let runner = RecipeRunner::new(
        FetcherSet::from_config(&config)?,
        FetchOptions {
            timeout: config.fetch_timeout(),
        },
    );
    let run = runner.run(&recipe, &bindings).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run.steps)?);
    } else {
        println!("recipe {} (v{})", recipe.recipe_type, recipe.version);
        for step in &run.steps {
            let mark = if step.success { "PASS" } else { "FAIL" };
            match &step.detail {
                Some(detail) => println!("  {mark} {} {detail}", step.step),
                None => println!("  {mark} {}", step.step),
            }
        }
    }

    Ok(if run.passed() { SUCCESS } else { NOT_VERIFIED })
}
