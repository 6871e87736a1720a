//! Agent defaults. Hosts layer file, env and CLI overrides on top.

use crate::allocator::AllocatorConfig;
use crate::load::LoadConfig;
use crate::transport::TransportConfig;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub allocator: AllocatorConfig,
    pub load: LoadConfig,
    pub transport: TransportConfig,
}
