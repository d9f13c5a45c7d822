pub mod delivery;
pub mod messaging;
pub mod proxy;
pub mod util;

#[cfg(test)] pub mod test_util;
