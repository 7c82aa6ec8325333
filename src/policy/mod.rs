//! Policy evaluation for elevated-access requests.
//!
//! Everything in this module is pure and synchronous: statements come from
//! the approval-policy document, the resource snapshot comes from the
//! directory listings, and [`evaluate_account_request`] /
//! [`evaluate_group_request`] turn the two plus a request into a
//! [`Decision`]. No I/O happens here.

mod decision;
mod statement;

pub use decision::{
    authorize_account_approval, authorize_group_approval, evaluate_account_request,
    evaluate_group_request, Decision, DecisionReason, Permit,
};
pub use statement::{
    accounts_in_scope, GroupStatement, PolicyConfiguration, ResourceSnapshot, Statement, ANY,
};
