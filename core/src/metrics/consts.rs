//! Calibration constants, centralised so nothing is duplicated across
//! metric modules. Values marked "calibration" are tuning choices carried
//! over from historical cycle analysis, not contracts.

/// Average block cadence used wherever a day has to be approximated in
/// blocks. Date-scoped metrics resolve exact ranges via `block_heights`;
/// only issuance estimation multiplies by this.
pub const BLOCKS_PER_DAY: u64 = 144;

/// Short-term vs long-term holder boundary.
pub const STH_THRESHOLD_DAYS: u64 = 155;
pub const STH_THRESHOLD_BLOCKS: u64 = STH_THRESHOLD_DAYS * BLOCKS_PER_DAY; // 22,320

/// MVRV-Z denominator factor: the simplified form divides the unrealized
/// gap by `realized_cap * MVRV_Z_K` instead of a historical stdev.
pub const MVRV_Z_K: f64 = 0.3;

/// HODL-bank scaling for Reserve Risk (normalises cumulative coin-days).
pub const HODL_BANK_SCALE: f64 = 1_000_000.0;

/// Fallback liveliness when no coin-days have been created yet.
pub const DEFAULT_LIVELINESS: f64 = 0.3;

/// Post-April-2024-halving issuance.
pub const BLOCK_REWARD_BTC: f64 = 3.125;

/// Default rolling window for spend-side metrics.
pub const DEFAULT_WINDOW_DAYS: u64 = 30;

/// URPD histogram bucket width in USD.
pub const URPD_BUCKET_USD: f64 = 5_000.0;

/// Binary CDD defaults; threshold clamps to [1,4] sigma, window to
/// [30,730] days, and fewer than MIN_DATA_POINTS daily samples force the
/// flag to 0 with `insufficient` set.
pub const BINARY_CDD_THRESHOLD: f64 = 2.0;
pub const BINARY_CDD_WINDOW_DAYS: u64 = 365;
pub const BINARY_CDD_MIN_POINTS: usize = 30;

/// Revived-supply age thresholds in days.
pub const REVIVED_1Y_DAYS: f64 = 365.0;
pub const REVIVED_2Y_DAYS: f64 = 730.0;
pub const REVIVED_5Y_DAYS: f64 = 1_825.0;

/// Exchange netflow zone boundaries in BTC/day. Calibration, not contract.
pub const NETFLOW_STRONG_FLOW_BTC: f64 = 1_000.0;

/// Revived-supply zone boundaries in BTC/day. Calibration.
pub const REVIVED_ZONE_NORMAL_BTC: f64 = 1_000.0;
pub const REVIVED_ZONE_ELEVATED_BTC: f64 = 5_000.0;
pub const REVIVED_ZONE_SPIKE_BTC: f64 = 10_000.0;
