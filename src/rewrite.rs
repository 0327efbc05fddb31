//! Rewrites requests for relocated third-party resources to their bundled copies.
//!
//! Matching is plain substring containment against the full request URL, in
//! declaration order, first match wins. There is no path-boundary
//! awareness: a bare filename rule matches anywhere in a longer URL.

use color_eyre::{eyre::eyre, Result};
use url::Url;

/// A single (match fragment, local path prefix) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
  pub fragment: String,
  pub prefix: String,
}

impl RedirectRule {
  pub fn new(fragment: impl Into<String>, prefix: impl Into<String>) -> Self {
    Self {
      fragment: fragment.into(),
      prefix: prefix.into(),
    }
  }

  /// Everything in `url` after the first occurrence of the fragment, if it matches.
  fn suffix<'a>(&self, url: &'a str) -> Option<&'a str> {
    url
      .find(&self.fragment)
      .map(|at| &url[at + self.fragment.len()..])
  }
}

/// Effective target of a request after the rewrite step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
  pub target: Url,
  /// True when a rule matched and the target now lives on the local origin.
  pub rewritten: bool,
}

/// Ordered redirect table bound to the local origin.
#[derive(Debug, Clone)]
pub struct Rewriter {
  origin: Url,
  rules: Vec<RedirectRule>,
}

impl Rewriter {
  pub fn new(origin: Url, rules: Vec<RedirectRule>) -> Self {
    Self { origin, rules }
  }

  pub fn from_pairs(origin: Url, pairs: &[(String, String)]) -> Self {
    let rules = pairs
      .iter()
      .map(|(fragment, prefix)| RedirectRule::new(fragment.as_str(), prefix.as_str()))
      .collect();
    Self::new(origin, rules)
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// First rule whose fragment occurs in `url`.
  pub fn matching_rule(&self, url: &str) -> Option<&RedirectRule> {
    self.rules.iter().find(|rule| url.contains(&rule.fragment))
  }

  /// Map `url` to its local equivalent, or pass it through unchanged.
  pub fn rewrite(&self, url: &Url) -> Result<Rewrite> {
    let raw = url.as_str();

    let Some((rule, suffix)) = self
      .rules
      .iter()
      .find_map(|rule| rule.suffix(raw).map(|suffix| (rule, suffix)))
    else {
      return Ok(Rewrite {
        target: url.clone(),
        rewritten: false,
      });
    };

    let path = join_path(&rule.prefix, suffix);
    let local = format!("{}{}", self.origin.origin().ascii_serialization(), path);
    let target =
      Url::parse(&local).map_err(|e| eyre!("Invalid rewrite target {}: {}", local, e))?;

    Ok(Rewrite {
      target,
      rewritten: true,
    })
  }
}

/// Concatenate a local prefix and a path suffix without doubling the separator.
fn join_path(prefix: &str, suffix: &str) -> String {
  let prefix = if prefix.starts_with('/') {
    prefix.to_string()
  } else {
    format!("/{}", prefix)
  };

  match (prefix.ends_with('/'), suffix.starts_with('/')) {
    (true, true) => format!("{}{}", prefix, &suffix[1..]),
    _ => format!("{}{}", prefix, suffix),
  }
}
