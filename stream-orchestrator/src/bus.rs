//! Channel router and wire audit trail.

pub mod router;
pub mod wire;

// Re-export main types
pub use router::{
    BindingAccessor, BusHooks, ChannelRouter, Handler, PageCallback, StateChange,
    HANDLER_ERROR_CHANNEL, UNHANDLED_CHANNEL,
};
pub use wire::{WireEntry, WireLog};
