use keytrace_core::{ProviderRegistry, RecipeBook};

use crate::cli::args::ProvidersArgs;
use crate::exit_codes::{NOT_VERIFIED, SUCCESS};

pub fn run(args: ProvidersArgs) -> i32 {
    let registry = ProviderRegistry::builtin();

    println!("Providers:");
    for provider in registry.providers() {
        let flag = if provider.is_ambiguous { " (ambiguous)" } else { "" };
        println!("  {:<12} {} <{}>{flag}", provider.id, provider.name, provider.homepage);
    }

    println!("Recipes:");
    for recipe in RecipeBook::builtin().recipes() {
        println!(
            "  {:<12} {} (v{})",
            recipe.recipe_type,
            recipe.display_name.as_deref().unwrap_or("-"),
            recipe.version
        );
    }

    if !args.self_test {
        return SUCCESS;
    }

    let failures = registry.run_self_tests();
    if failures.is_empty() {
        println!("All provider self-tests passed");
        return SUCCESS;
    }
    for failure in &failures {
        let expected = if failure.expected_match { "match" } else { "no match" };
        println!(
            "  self-test failed: {} expected {expected} for {}",
            failure.provider, failure.uri
        );
    }
    NOT_VERIFIED
}
