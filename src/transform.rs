use crate::error::BoxError;

/// The per-item work a stage performs.
///
/// A transform is shared by every worker of its stage, so it takes `&self`
/// and must not keep per-call state that would race between workers.
/// It may produce 0, 1, or multiple outputs per input.
pub trait Transform<I, O>: Send + Sync + 'static {
    /// Process one payload
    fn apply(&self, input: I) -> Result<Vec<O>, BoxError>;

    /// Get a human-readable name for this transform
    fn name(&self) -> &str {
        "transform"
    }
}

/// Forwards every payload unchanged
#[derive(Debug, Default)]
pub struct PassthroughTransform;

impl<T: Send + 'static> Transform<T, T> for PassthroughTransform {
    fn apply(&self, input: T) -> Result<Vec<T>, BoxError> {
        Ok(vec![input])
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Keeps payloads matching a predicate
pub struct FilterTransform<F> {
    name: String,
    predicate: F,
}

impl<F> FilterTransform<F> {
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<T, F> Transform<T, T> for FilterTransform<F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn apply(&self, input: T) -> Result<Vec<T>, BoxError> {
        if (self.predicate)(&input) {
            Ok(vec![input])
        } else {
            Ok(vec![])
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Maps each payload to exactly one output
pub struct MapTransform<F> {
    name: String,
    mapper: F,
}

impl<F> MapTransform<F> {
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<I, O, F> Transform<I, O> for MapTransform<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Result<O, BoxError> + Send + Sync + 'static,
{
    fn apply(&self, input: I) -> Result<Vec<O>, BoxError> {
        Ok(vec![(self.mapper)(input)?])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Maps each payload to any number of outputs
pub struct FlatMapTransform<F> {
    name: String,
    mapper: F,
}

impl<F> FlatMapTransform<F> {
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<I, O, F> Transform<I, O> for FlatMapTransform<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Result<Vec<O>, BoxError> + Send + Sync + 'static,
{
    fn apply(&self, input: I) -> Result<Vec<O>, BoxError> {
        (self.mapper)(input)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
