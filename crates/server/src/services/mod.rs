pub mod model_manager;
pub mod reaper;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
