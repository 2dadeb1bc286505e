//! Session engine integration tests over real loopback sockets

mod helpers;

mod handshake_integration;
mod lifecycle_integration;
