//! Governance subsystems, leaf-first.

pub mod arbitration;
pub mod decide;
pub mod interference;
pub mod ledger;
pub mod optr;
pub mod pipeline;
pub mod promotion;
pub mod quorum;
pub mod trust;
