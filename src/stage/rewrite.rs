/*!
 * Text rewrite stages: pattern substitution and `${VAR}` interpolation
 */

use std::borrow::Cow;
use std::collections::HashMap;

use regex::{Captures, Regex};
use tracing::{debug, info};

use super::{Downstream, Stage};
use crate::channel::ChannelReader;
use crate::error::{FlowError, Result};

/// Replaces every occurrence of a literal string or a regex
#[derive(Debug)]
pub struct Substitute {
    source: String,
    replacement: String,
    regex: bool,
    compiled: Option<Regex>,
}

impl Substitute {
    /// Literal replace-all
    pub fn literal(source: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            replacement: replacement.into(),
            regex: false,
            compiled: None,
        }
    }

    /// Regex replace-all; `$1`/`${name}` in the replacement expand to groups
    pub fn regex(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            regex: true,
            ..Self::literal(pattern, replacement)
        }
    }

    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match &self.compiled {
            Some(re) => re.replace_all(text, self.replacement.as_str()),
            None => {
                if self.source.is_empty() || !text.contains(&self.source) {
                    Cow::Borrowed(text)
                } else {
                    Cow::Owned(text.replace(&self.source, &self.replacement))
                }
            }
        }
    }
}

impl Stage for Substitute {
    fn name(&self) -> &str {
        "substitute"
    }

    fn has_upstream(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<()> {
        if self.regex {
            let re = Regex::new(&self.source)?;
            self.compiled = Some(re);
        } else if self.source.is_empty() {
            return Err(FlowError::Config(
                "substitute: source must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn consume(&mut self, mut input: ChannelReader, output: &mut Downstream) -> Result<()> {
        for text in input.texts("substitute") {
            let text = text?;
            info!("Replacing '{}' by '{}' on input text", self.source, self.replacement);
            let rewritten = self.apply(&text).into_owned();
            output.text(rewritten)?;
        }
        Ok(())
    }

    fn produce(&mut self, _output: &mut Downstream) -> Result<()> {
        Ok(())
    }
}

/// Where `Envsub` looks variables up
#[derive(Debug, Clone)]
enum VarSource {
    Process,
    Fixed(HashMap<String, String>),
}

/// Expands `${NAME}` placeholders from environment variables
///
/// Placeholders whose variable is unset or empty are left as they are.
#[derive(Debug)]
pub struct Envsub {
    vars: VarSource,
    placeholder: Option<Regex>,
}

impl Envsub {
    /// Read variables from the process environment
    pub fn new() -> Self {
        Self {
            vars: VarSource::Process,
            placeholder: None,
        }
    }

    /// Read variables from a fixed map instead of the environment
    pub fn with_vars(vars: HashMap<String, String>) -> Self {
        Self {
            vars: VarSource::Fixed(vars),
            placeholder: None,
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        let value = match &self.vars {
            VarSource::Process => std::env::var(name).ok(),
            VarSource::Fixed(vars) => vars.get(name).cloned(),
        };
        value.filter(|v| !v.is_empty())
    }

    fn expand<'a>(&self, re: &Regex, text: &'a str) -> Cow<'a, str> {
        re.replace_all(text, |caps: &Captures| match self.lookup(&caps[1]) {
            Some(value) => value,
            None => {
                debug!("Leaving '{}' untouched, variable not set", &caps[0]);
                caps[0].to_string()
            }
        })
    }
}

impl Default for Envsub {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Envsub {
    fn name(&self) -> &str {
        "envsub"
    }

    fn has_upstream(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<()> {
        self.placeholder = Some(Regex::new(r"\$\{([^}]+)\}")?);
        Ok(())
    }

    fn consume(&mut self, mut input: ChannelReader, output: &mut Downstream) -> Result<()> {
        let re = self
            .placeholder
            .clone()
            .ok_or_else(|| FlowError::Config("envsub: consume before init".into()))?;

        for text in input.texts("envsub") {
            let text = text?;
            info!("Replacing environment variables on input text");
            let expanded = self.expand(&re, &text).into_owned();
            output.text(expanded)?;
        }
        Ok(())
    }

    fn produce(&mut self, _output: &mut Downstream) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, Item};
    use crate::stage::run_stage;
    use bytes::Bytes;

    fn run(stage: Box<dyn Stage>, inputs: Vec<Item>) -> (Result<u64>, Vec<String>) {
        let (mut up_tx, up_rx) = channel("in", 16);
        for item in inputs {
            up_tx.emit(item).unwrap();
        }
        up_tx.close().unwrap();

        let (tx, rx) = channel("out", 16);
        let result = run_stage(stage, Some(up_rx), Some(tx)).map(|r| r.items_emitted);
        let texts = rx
            .filter_map(|i| match i {
                Ok(Item::Text(t)) => Some(t),
                _ => None,
            })
            .collect();
        (result, texts)
    }

    fn texts(values: &[&str]) -> Vec<Item> {
        values.iter().map(|v| Item::Text(v.to_string())).collect()
    }

    #[test]
    fn test_literal_substitution() {
        let stage = Substitute::literal("{X}", "42");
        let (result, out) = run(Box::new(stage), texts(&["value is {X}", "{X}+{X}", "none"]));

        assert_eq!(result.unwrap(), 3);
        assert_eq!(out, vec!["value is 42", "42+42", "none"]);
    }

    #[test]
    fn test_literal_does_not_interpret_regex() {
        let stage = Substitute::literal("a.c", "!");
        let (_, out) = run(Box::new(stage), texts(&["abc a.c"]));
        assert_eq!(out, vec!["abc !"]);
    }

    #[test]
    fn test_regex_substitution() {
        let stage = Substitute::regex(r"(\d+)px", "${1}em");
        let (_, out) = run(Box::new(stage), texts(&["width: 12px; height: 3px"]));
        assert_eq!(out, vec!["width: 12em; height: 3em"]);
    }

    #[test]
    fn test_invalid_regex_fails_init() {
        let stage = Substitute::regex("(unclosed", "x");
        let (result, out) = run(Box::new(stage), texts(&["anything"]));
        assert!(matches!(result, Err(FlowError::Config(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_substitute_rejects_buffers() {
        let stage = Substitute::literal("a", "b");
        let (result, _) = run(
            Box::new(stage),
            vec![Item::Buffer(Bytes::from_static(b"a"))],
        );
        assert!(matches!(result, Err(FlowError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_envsub_replaces_set_variables_only() {
        let vars = HashMap::from([
            ("VAR".to_string(), "42".to_string()),
            ("EMPTY".to_string(), String::new()),
        ]);
        let stage = Envsub::with_vars(vars);
        let (_, out) = run(
            Box::new(stage),
            texts(&["${VAR}", "a ${VAR} b ${UNSET} c ${EMPTY}", "$VAR {VAR}"]),
        );

        assert_eq!(out, vec!["42", "a 42 b ${UNSET} c ${EMPTY}", "$VAR {VAR}"]);
    }

    #[test]
    fn test_envsub_reads_process_environment() {
        std::env::set_var("FILEFLOW_ENVSUB_TEST", "from-env");
        let (_, out) = run(Box::new(Envsub::new()), texts(&["x=${FILEFLOW_ENVSUB_TEST}"]));
        assert_eq!(out, vec!["x=from-env"]);
    }
}
