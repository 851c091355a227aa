//! Order sizing
//!
//! Volumes are always whole lots. Anything that rounds below one lot is
//! dropped for the tick rather than sent as an odd lot.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::StrategyConfig;
use crate::portfolio::PositionAccount;
use crate::trade_loop::TradeLoop;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sizing {
    Order(u64),
    /// Clamps left less than one lot
    Dropped { requested: u64, clamped: u64 },
}

/// Round down to a whole number of lots
pub fn round_to_lot(volume: u64, lot_size: u64) -> u64 {
    let lot = lot_size.max(1);
    volume - volume % lot
}

/// Size an order for `side` at `price`.
///
/// A closing order starts from the pending loop's open volume; an opening
/// order from the configured per-order cap (one lot when unset).
pub fn size_order(
    side: Side,
    price: Decimal,
    config: &StrategyConfig,
    account: &PositionAccount,
    closing: Option<&TradeLoop>,
    lot_size: u64,
) -> Sizing {
    let lot = lot_size.max(1);
    let cap = match side {
        Side::Buy => config.buy_shares,
        Side::Sell => config.sell_shares,
    };

    let requested = match closing {
        Some(open) => cap.map_or(open.open_volume, |c| c.min(open.open_volume)),
        None => cap.unwrap_or(lot),
    };

    let mut volume = requested;
    match side {
        Side::Buy => {
            if price > Decimal::ZERO {
                if let Some(max_amount) = config.max_order_amount {
                    volume = volume.min(shares_affordable(max_amount, price));
                }
                volume = volume.min(shares_affordable(account.balance, price));
            } else {
                volume = 0;
            }
        }
        Side::Sell => {
            volume = volume.min(account.available_shares);
        }
    }

    let rounded = round_to_lot(volume, lot);
    if rounded < lot {
        Sizing::Dropped { requested, clamped: volume }
    } else {
        Sizing::Order(rounded)
    }
}

fn shares_affordable(amount: Decimal, price: Decimal) -> u64 {
    if amount <= Decimal::ZERO {
        return 0;
    }
    (amount / price).floor().to_u64().unwrap_or(0)
}
