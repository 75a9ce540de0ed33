//! podgate billing
//!
//! Charge negotiation and recurring payments for pod hosting.
//!
//! ```text
//!            ┌──────────────────────┐
//! request ──►│   ChargeNegotiator   │──► 402 PaymentChallenge
//!            └──┬───────┬───────┬───┘
//!               │       │       │
//!        StreamTransport│  RecurringPullEngine ──► PullEvent channel
//!                 PullTransport                          │
//!                                                        ▼
//!            ProfitLedger ◄──────────── RecurringPullCoordinator ──► PodRegistry
//! ```

pub mod challenge;
pub mod coordinator;
pub mod ledger;
pub mod negotiator;
pub mod pricing;
pub mod recurring;
pub mod simulated;
pub mod transport;

pub use challenge::{headers, parse_pay_accept, PaymentChallenge, PaymentMethod};
pub use coordinator::{adjusted_duration, RecurringPullCoordinator};
pub use ledger::{credit_profit, InMemoryProfitLedger, LedgerError, ProfitLedger};
pub use negotiator::{
    clamp_duration, select_flow, ChargeError, ChargeNegotiator, ChargePolicy, ChargeRequest, Flow,
};
pub use pricing::{
    price_for, FixedRateFeed, MonthlyCostFeed, PriceError, PriceFeed, PriceQuote, SettlementAsset,
    SECONDS_PER_MONTH,
};
pub use recurring::{PullEvent, PullEvents, RecurringPull, RecurringPullEngine, ScheduledPullEngine};
pub use simulated::{SimulatedPullTransport, SimulatedStreamTransport};
pub use transport::{
    PaymentStream, PullFailure, PullTransport, StreamCredentials, StreamFailure, StreamTransport,
};
