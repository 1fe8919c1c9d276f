//! Step bodies: what each kind of [`crate::step::BuildStep`] actually does
//! once its dependencies have drained.

pub(crate) mod cc;
pub(crate) mod irgen;
pub(crate) mod ld;
pub(crate) mod sys;
