pub mod config;
pub mod semantic;
#[cfg(test)]
mod tests;
