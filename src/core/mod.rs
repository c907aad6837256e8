pub mod domain;
pub mod evaluator;
pub mod gate;
pub mod judging;
pub mod pipeline;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;
