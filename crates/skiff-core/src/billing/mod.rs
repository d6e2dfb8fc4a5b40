//! Refund valuation and wallet settlement

pub mod refund;
pub mod wallet;

pub use refund::{
    RefundCurvePoint, RefundPolicy, RefundQuote, RefundRule, RefundSubject, evaluate_curve,
    normalize_curve, quote_refund, threshold_to_ratio,
};
pub use wallet::{
    REF_WALLET_ORDER, RefundService, WalletOrder, WalletOrderKind, WalletOrderStatus,
    WalletRepository,
};
