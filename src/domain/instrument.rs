use rust_decimal::Decimal;

/// Exchange-side trading rules for one symbol, refreshed on a TTL by
/// `InstrumentCache`.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_order_qty: Decimal,
    pub status: String,
}

impl Instrument {
    /// Round `price` down to the nearest multiple of `tick_size`.
    pub fn snap_price(&self, price: Decimal) -> Decimal {
        snap_down(price, self.tick_size)
    }

    /// Round `qty` down to the nearest multiple of `qty_step`.
    pub fn snap_qty(&self, qty: Decimal) -> Decimal {
        snap_down(qty, self.qty_step)
    }
}

fn snap_down(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Instrument {
        Instrument {
            symbol: "BTCUSDT".to_string(),
            tick_size: dec!(0.1),
            qty_step: dec!(0.001),
            min_order_qty: dec!(0.001),
            status: "Trading".to_string(),
        }
    }

    #[test]
    fn snaps_price_down_to_tick() {
        let inst = sample();
        assert_eq!(inst.snap_price(dec!(100.37)), dec!(100.3));
    }

    #[test]
    fn snaps_qty_down_to_step() {
        let inst = sample();
        assert_eq!(inst.snap_qty(dec!(0.0129)), dec!(0.012));
    }
}
