use fluent_bundle::{FluentArgs, FluentBundle, FluentResource, FluentValue};
use tracing::warn;
use unic_langid::LanguageIdentifier;

use crate::error::InstallError;

const EN_GB: &str = include_str!("../i18n/en-GB.ftl");

/// Fluent-based localizer with built-in resources.
pub struct FluentLoc {
    bundle: FluentBundle<FluentResource>,
}

impl FluentLoc {
    /// Localizer for `lang`. Only `en-GB` ships today; other tags fall back to it.
    pub fn builtin(lang: &str) -> Self {
        let langid: LanguageIdentifier =
            lang.parse().or_else(|_| "en-GB".parse()).unwrap_or_default();
        let mut bundle = FluentBundle::new(vec![langid]);
        bundle.set_use_isolating(false);
        match FluentResource::try_new(EN_GB.to_owned()) {
            Ok(res) => {
                if let Err(errs) = bundle.add_resource(res) {
                    warn!("duplicate messages in en-GB.ftl: {}", errs.len());
                }
            }
            Err((_, errs)) => warn!("en-GB.ftl failed to parse: {} errors", errs.len()),
        }
        Self { bundle }
    }

    /// Format a message by id with named args. Returns the id itself if not found.
    pub fn msg(&self, id: &str, args: &[(&str, &str)]) -> String {
        let Some(pattern) = self.bundle.get_message(id).and_then(|m| m.value()) else {
            return id.to_string();
        };
        let mut fa = FluentArgs::new();
        for (k, v) in args {
            fa.set(*k, FluentValue::from(*v));
        }
        let mut errs = vec![];
        let s = self.bundle.format_pattern(pattern, Some(&fa), &mut errs).to_string();
        if errs.is_empty() {
            s
        } else {
            id.to_string()
        }
    }

    /// User-facing text for an installer error, prefixed with its code.
    pub fn error(&self, err: &InstallError) -> String {
        let code = err.code.short();
        format!("[{code}] {}", self.msg(&code, &[("detail", err.message.as_str())]))
    }
}
