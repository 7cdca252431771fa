//! Failure classification over `dyn Error`
//!
//! Circuit breakers and retries decide which failures count (or are retried,
//! or are ignored) with a [`FailureClassifier`]. A classifier matches by
//! concrete error type anywhere in the `source()` chain, or by predicate.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

type Matcher = dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync;

#[derive(Clone)]
enum Rule {
    Any,
    Nothing,
    OneOf(Vec<Arc<Matcher>>),
}

/// Decides whether a failure belongs to a class
#[derive(Clone)]
pub struct FailureClassifier {
    rule: Rule,
}

impl FailureClassifier {
    /// Matches every failure
    pub fn any() -> Self {
        Self { rule: Rule::Any }
    }

    /// Matches no failure
    pub fn none() -> Self {
        Self { rule: Rule::Nothing }
    }

    /// Matches errors of type `T`, directly or anywhere in the source chain
    pub fn of<T: Error + 'static>() -> Self {
        Self::predicate(|err| source_chain(err).any(|e| e.is::<T>()))
    }

    /// Matches errors accepted by `predicate`
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self { rule: Rule::OneOf(vec![Arc::new(predicate)]) }
    }

    /// Also match errors of type `T`
    pub fn or_of<T: Error + 'static>(self) -> Self {
        self.or(Self::of::<T>())
    }

    /// Union of two classifiers
    pub fn or(self, other: Self) -> Self {
        match (self.rule, other.rule) {
            (Rule::Any, _) | (_, Rule::Any) => Self::any(),
            (Rule::Nothing, rule) | (rule, Rule::Nothing) => Self { rule },
            (Rule::OneOf(mut left), Rule::OneOf(right)) => {
                left.extend(right);
                Self { rule: Rule::OneOf(left) }
            }
        }
    }

    /// Whether `error` belongs to this class
    pub fn matches(&self, error: &(dyn Error + 'static)) -> bool {
        match &self.rule {
            Rule::Any => true,
            Rule::Nothing => false,
            Rule::OneOf(matchers) => matchers.iter().any(|m| m(error)),
        }
    }
}

impl fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rule {
            Rule::Any => f.write_str("FailureClassifier::Any"),
            Rule::Nothing => f.write_str("FailureClassifier::None"),
            Rule::OneOf(m) => write!(f, "FailureClassifier::OneOf({} matchers)", m.len()),
        }
    }
}

fn source_chain<'a>(
    err: &'a (dyn Error + 'static),
) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |e: &&'a (dyn Error + 'static)| (*e).source())
}
