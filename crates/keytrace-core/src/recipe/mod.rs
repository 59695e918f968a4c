//! Declarative verification recipes.
//!
//! A recipe describes a verification procedure as data: an ordered list of
//! `http-get` and `json-path` actions run against placeholder bindings.
//! New services can be onboarded by shipping a recipe file, without code.

mod selector;

pub use selector::Selector;

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{KeytraceError, KeytraceResult};
use crate::fetchers::{FetchOptions, FetcherKind, FetcherSet};
use crate::providers::{ProofFormat, ProofRequest, Relation};
use crate::verify::VerificationStep;

/// Recipe format version understood by the runner.
pub const RECIPE_VERSION: u32 = 1;

const TANGLED_RECIPE: &str = include_str!("tangled.json");

static BUILTIN: Lazy<RecipeBook> = Lazy::new(|| {
    RecipeBook::new()
        .with(Recipe::from_json_str(TANGLED_RECIPE).expect("built-in recipe parses"))
        .expect("built-in recipe is valid")
});

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern"));

/// A recipe parameter supplied by the claimant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeParam {
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,

    /// Values (and claim URIs) must match this pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Pattern whose first group yields the account subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_from: Option<String>,
}

/// Human instructions for publishing the proof.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeInstructions {
    #[serde(default)]
    pub steps: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_location: Option<String>,
}

/// One verification action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RecipeStep {
    /// Fetch a JSON document and make it the active context.
    HttpGet { url: String },

    /// Assert on a value of the active context.
    JsonPath { selector: String, expect: String },
}

impl RecipeStep {
    /// Name used in the step log.
    pub fn name(&self) -> String {
        match self {
            Self::HttpGet { .. } => "http-get".to_string(),
            Self::JsonPath { selector, .. } => format!("json-path:{selector}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeVerification {
    pub steps: Vec<RecipeStep>,
}

/// A declarative verification recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,

    /// Claim type this recipe verifies.
    #[serde(rename = "type")]
    pub recipe_type: String,

    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default)]
    pub params: Vec<RecipeParam>,

    #[serde(default)]
    pub instructions: RecipeInstructions,

    pub verification: RecipeVerification,
}

/// A claim URI bound to a recipe parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeMatch {
    /// Parameter the URI binds to.
    pub param: String,
    /// Subject extracted via `extractFrom`, when present.
    pub subject: Option<String>,
}

impl Recipe {
    /// Parse and validate a JSON recipe.
    pub fn from_json_str(content: &str) -> KeytraceResult<Self> {
        let recipe: Self = serde_json::from_str(content)
            .map_err(|e| KeytraceError::malformed(format!("invalid recipe JSON: {e}")))?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Parse and validate a YAML recipe.
    pub fn from_yaml_str(content: &str) -> KeytraceResult<Self> {
        let recipe: Self = serde_yaml::from_str(content)
            .map_err(|e| KeytraceError::malformed(format!("invalid recipe YAML: {e}")))?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Load a recipe file; `.yaml`/`.yml` files are YAML, everything else JSON.
    pub async fn from_file(path: &Path) -> KeytraceResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KeytraceError::Storage {
                message: format!("failed to read recipe {}: {}", path.display(), e),
            })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    /// Check the recipe is well-formed before it is ever run.
    pub fn validate(&self) -> KeytraceResult<()> {
        let invalid = |why: String| {
            KeytraceError::malformed(format!("recipe {:?}: {why}", self.recipe_type))
        };

        if self.recipe_type.trim().is_empty() {
            return Err(invalid("type must not be empty".to_string()));
        }
        if self.version != RECIPE_VERSION {
            return Err(invalid(format!("unsupported version {}", self.version)));
        }
        if self.verification.steps.is_empty() {
            return Err(invalid("no verification steps".to_string()));
        }
        for param in &self.params {
            for pattern in param.pattern.iter().chain(param.extract_from.iter()) {
                Regex::new(pattern)
                    .map_err(|e| invalid(format!("param {} has a bad pattern: {e}", param.key)))?;
            }
        }
        for step in &self.verification.steps {
            if let RecipeStep::JsonPath { selector, expect } = step {
                selector.parse::<Selector>()?;
                expect.parse::<Expectation>()?;
            }
        }
        Ok(())
    }

    /// The first parameter whose pattern matches `uri`.
    pub fn match_uri(&self, uri: &str) -> Option<RecipeMatch> {
        self.params.iter().find_map(|param| {
            let pattern = Regex::new(param.pattern.as_deref()?).ok()?;
            if !pattern.is_match(uri) {
                return None;
            }
            let subject = param
                .extract_from
                .as_deref()
                .and_then(|p| Regex::new(p).ok())
                .and_then(|re| re.captures(uri))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());
            Some(RecipeMatch {
                param: param.key.clone(),
                subject,
            })
        })
    }

    /// The proof the claimant must publish, with placeholders filled.
    pub fn proof_text(&self, bindings: &Bindings) -> Option<KeytraceResult<String>> {
        self.instructions
            .proof_template
            .as_deref()
            .map(|template| bindings.substitute(template))
    }

    /// Bindings for verifying `uri` as claim `claim_id` of `did`.
    pub fn bindings_for(&self, claim_id: &str, did: &str, uri: &str) -> Bindings {
        let bindings = Bindings::for_claim(claim_id, did);
        match self.match_uri(uri) {
            Some(m) => bindings.with(m.param, uri),
            None => bindings,
        }
    }
}

/// Placeholder values for a recipe run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    /// Bindings carrying `claimId` and `did`.
    pub fn for_claim(claim_id: &str, did: &str) -> Self {
        Self::default().with("claimId", claim_id).with("did", did)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Replace every `{name}` in `template`.
    ///
    /// Fails with `MalformedInput` naming the first unbound placeholder.
    pub fn substitute(&self, template: &str) -> KeytraceResult<String> {
        if let Some(missing) = PLACEHOLDER_RE
            .captures_iter(template)
            .filter_map(|caps| caps.get(1))
            .find(|name| !self.values.contains_key(name.as_str()))
        {
            return Err(KeytraceError::malformed(format!(
                "unknown placeholder {{{}}}",
                missing.as_str()
            )));
        }

        Ok(PLACEHOLDER_RE
            .replace_all(template, |caps: &regex::Captures<'_>| {
                self.values
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned())
    }
}

/// A parsed `"<relation>:<valueTemplate>"` expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub relation: Relation,
    pub template: String,
}

impl FromStr for Expectation {
    type Err = KeytraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (relation, template) = s.split_once(':').ok_or_else(|| {
            KeytraceError::malformed(format!("expectation {s:?} must be <relation>:<value>"))
        })?;
        Ok(Self {
            relation: relation.parse()?,
            template: template.to_string(),
        })
    }
}

/// Outcome of running a recipe.
#[derive(Debug)]
pub struct RecipeRun {
    /// One entry per executed step, in order.
    pub steps: Vec<VerificationStep>,
    /// The error of the step that aborted the run.
    pub failure: Option<KeytraceError>,
    /// The last fetched document.
    pub document: Option<Value>,
}

impl RecipeRun {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Executes recipes step by step.
#[derive(Debug, Clone)]
pub struct RecipeRunner {
    fetchers: FetcherSet,
    options: FetchOptions,
}

impl RecipeRunner {
    pub fn new(fetchers: FetcherSet, options: FetchOptions) -> Self {
        Self { fetchers, options }
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(&self, recipe: &Recipe, bindings: &Bindings) -> RecipeRun {
        let mut run = RecipeRun {
            steps: Vec::with_capacity(recipe.verification.steps.len()),
            failure: None,
            document: None,
        };

        for step in &recipe.verification.steps {
            let name = step.name();
            match self.run_step(step, bindings, &mut run.document).await {
                Ok(detail) => run.steps.push(VerificationStep::passed(name, detail)),
                Err(e) => {
                    debug!(recipe = %recipe.recipe_type, step = %name, error = %e, "recipe step failed");
                    run.steps.push(VerificationStep::failed(name, e.to_string()));
                    run.failure = Some(e);
                    break;
                }
            }
        }
        run
    }

    async fn run_step(
        &self,
        step: &RecipeStep,
        bindings: &Bindings,
        context: &mut Option<Value>,
    ) -> KeytraceResult<Option<String>> {
        match step {
            RecipeStep::HttpGet { url } => {
                let url = bindings.substitute(url)?;
                let request = ProofRequest {
                    uri: url.clone(),
                    fetcher: FetcherKind::Http,
                    format: ProofFormat::Json,
                };
                let doc = self
                    .fetchers
                    .fetch(&request, &self.options)
                    .await?
                    .ok_or_else(|| KeytraceError::NotFound { what: url.clone() })?;
                *context = Some(doc.to_json());
                Ok(Some(url))
            }
            RecipeStep::JsonPath { selector, expect } => {
                let parsed: Selector = selector.parse()?;
                let expectation: Expectation = expect.parse()?;
                let expected = bindings.substitute(&expectation.template)?;

                let mismatch = |reason: String| KeytraceError::AssertionMismatch {
                    selector: selector.clone(),
                    reason,
                };

                let doc = context
                    .as_ref()
                    .ok_or_else(|| mismatch("no document fetched".to_string()))?;
                let value = parsed
                    .select(doc)
                    .ok_or_else(|| mismatch("selector matched nothing".to_string()))?;
                let found = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };

                if expectation.relation.holds(&found, &expected) {
                    Ok(Some(format!("{} {}", expectation.relation, expected)))
                } else {
                    Err(mismatch(format!(
                        "expected value to {} {:?}, found {:?}",
                        expectation.relation, expected, found
                    )))
                }
            }
        }
    }
}

/// Registered recipes, looked up by type or by claim URI.
#[derive(Debug, Clone, Default)]
pub struct RecipeBook {
    recipes: Vec<Recipe>,
}

impl RecipeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recipes shipped with keytrace.
    pub fn builtin() -> &'static RecipeBook {
        &BUILTIN
    }

    /// Add a recipe, replacing one of the same type.
    pub fn with(mut self, recipe: Recipe) -> KeytraceResult<Self> {
        recipe.validate()?;
        self.recipes.retain(|r| r.recipe_type != recipe.recipe_type);
        self.recipes.push(recipe);
        Ok(self)
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    pub fn get(&self, recipe_type: &str) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.recipe_type == recipe_type)
    }

    /// Every recipe whose parameters accept `uri`.
    pub fn find_all(&self, uri: &str) -> Vec<(&Recipe, RecipeMatch)> {
        self.recipes
            .iter()
            .filter_map(|r| r.match_uri(uri).map(|m| (r, m)))
            .collect()
    }
}
