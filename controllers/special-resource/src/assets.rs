//! Chart template classification.
//!
//! A template's role is a pure function of its file name:
//! - `0001-namespace.yaml`: stateful, one ordered provisioning step
//! - `_helpers.tpl`, `helpers.tpl`: named, shared helpers included in every step
//! - anything else: stateless, applied once after all steps

use std::sync::LazyLock;

use helmer::ChartFile;
use regex::Regex;

static STATE_NAME: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[0-9]{4}[-_].*\.ya?ml$"));

/// Role of a template within the chart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Stateful,
    Named,
    Stateless,
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether the file name carries a 4-digit ordinal prefix
pub fn is_stateful_name(path: &str) -> bool {
    match STATE_NAME.as_ref() {
        Ok(re) => re.is_match(base_name(path)),
        Err(_) => false,
    }
}

/// Whether the file holds named templates only
pub fn is_named_template(path: &str) -> bool {
    let base = base_name(path);
    base.starts_with('_') || base.ends_with(".tpl")
}

/// The 4-digit ordinal of a stateful template (e.g. `0001`)
pub fn ordinal_prefix(path: &str) -> Option<&str> {
    if !is_stateful_name(path) {
        return None;
    }
    base_name(path).get(..4)
}

pub fn classify(path: &str) -> TemplateKind {
    if is_stateful_name(path) {
        TemplateKind::Stateful
    } else if is_named_template(path) {
        TemplateKind::Named
    } else {
        TemplateKind::Stateless
    }
}

/// Templates of one chart grouped by role
#[derive(Debug, Clone, Default)]
pub struct ClassifiedTemplates {
    /// Sorted by name, which is execution order
    pub stateful: Vec<ChartFile>,
    pub named: Vec<ChartFile>,
    pub stateless: Vec<ChartFile>,
}

impl ClassifiedTemplates {
    pub fn from_templates(templates: &[ChartFile]) -> Self {
        let mut classified = Self::default();
        for template in templates {
            match classify(&template.name) {
                TemplateKind::Stateful => classified.stateful.push(template.clone()),
                TemplateKind::Named => classified.named.push(template.clone()),
                TemplateKind::Stateless => classified.stateless.push(template.clone()),
            }
        }
        classified.stateful.sort_by(|a, b| a.name.cmp(&b.name));
        classified
    }

    /// Named templates followed by `extra`
    pub fn with_named(&self, extra: impl IntoIterator<Item = ChartFile>) -> Vec<ChartFile> {
        self.named.iter().cloned().chain(extra).collect()
    }
}
