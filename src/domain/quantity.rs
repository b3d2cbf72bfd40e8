// ==========================================
// 毛绒玩具生产编排核心 - 定点数量
// ==========================================
// 红线: 台账运算禁止浮点
// 精度: 千分位 (1 单位 = 1000 milli)
// 取整: 物料需求一律向上取整（宁多勿少）
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;
use thiserror::Error;

/// 定点数量（千分位精度，带符号）
///
/// 台账账面库存在欠账场景下允许为负，因此使用 i64。
/// 外部输入不得超过 `Qty::MAX`；运算溢出时饱和到 i64 边界，不回绕。
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Qty(i64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QtyParseError {
    #[error("数量格式错误: {0}")]
    Malformed(String),

    #[error("小数位超过3位: {0}")]
    TooPrecise(String),

    #[error("数量超出上限 {max}: {value}")]
    OutOfRange { value: String, max: Qty },
}

impl Qty {
    /// 每单位对应的 milli 数
    pub const SCALE: i64 = 1000;
    pub const ZERO: Qty = Qty(0);
    /// 可接受的最大数量（10 亿单位）
    pub const MAX: Qty = Qty(1_000_000_000 * Self::SCALE);

    pub const fn from_milli(milli: i64) -> Self {
        Qty(milli)
    }

    pub const fn from_units(units: i64) -> Self {
        Qty(units.saturating_mul(Self::SCALE))
    }

    pub const fn milli(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Qty(self.0.saturating_abs())
    }

    /// 绝对值是否超出可接受上限
    pub fn exceeds_limit(self) -> bool {
        self.0.unsigned_abs() > Self::MAX.0.unsigned_abs()
    }

    pub fn checked_add(self, rhs: Qty) -> Option<Qty> {
        self.0.checked_add(rhs.0).map(Qty)
    }

    pub fn checked_sub(self, rhs: Qty) -> Option<Qty> {
        self.0.checked_sub(rhs.0).map(Qty)
    }

    /// 负数截断为 0
    pub fn non_negative(self) -> Self {
        Qty(self.0.max(0))
    }

    /// 是否为整件数
    pub fn is_whole_units(self) -> bool {
        self.0 % Self::SCALE == 0
    }

    /// 向下截断到整件
    pub fn floor_units(self) -> Self {
        Qty(self.0.div_euclid(Self::SCALE).saturating_mul(Self::SCALE))
    }

    /// 向上取整到物料最小计量单位
    ///
    /// step <= 0 时视为不取整
    pub fn ceil_to_step(self, step: Qty) -> Self {
        if step.0 <= 0 {
            return self;
        }
        Qty(saturate(ceil_div_i128(self.0 as i128, step.0 as i128) * step.0 as i128))
    }
}

impl fmt::Display for Qty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{}{}.{:03}",
            sign,
            abs / Self::SCALE as u64,
            abs % Self::SCALE as u64
        )
    }
}

impl FromStr for Qty {
    type Err = QtyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (negative, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if body.is_empty() {
            return Err(QtyParseError::Malformed(s.to_string()));
        }

        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if frac_part.len() > 3 {
            return Err(QtyParseError::TooPrecise(s.to_string()));
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(QtyParseError::Malformed(s.to_string()));
        }
        let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if !all_digits(int_part) || !all_digits(frac_part) {
            return Err(QtyParseError::Malformed(s.to_string()));
        }

        let units: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| QtyParseError::Malformed(s.to_string()))?
        };
        let frac: i64 = format!("{:0<3}", frac_part)
            .parse()
            .map_err(|_| QtyParseError::Malformed(s.to_string()))?;

        let milli = units
            .checked_mul(Self::SCALE)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(|| QtyParseError::Malformed(s.to_string()))?;
        let qty = Qty(if negative { -milli } else { milli });
        if qty.exceeds_limit() {
            return Err(QtyParseError::OutOfRange {
                value: s.to_string(),
                max: Self::MAX,
            });
        }
        Ok(qty)
    }
}

impl Add for Qty {
    type Output = Qty;
    fn add(self, rhs: Qty) -> Qty {
        Qty(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Qty {
    type Output = Qty;
    fn sub(self, rhs: Qty) -> Qty {
        Qty(self.0.saturating_sub(rhs.0))
    }
}

impl AddAssign for Qty {
    fn add_assign(&mut self, rhs: Qty) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl SubAssign for Qty {
    fn sub_assign(&mut self, rhs: Qty) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Neg for Qty {
    type Output = Qty;
    fn neg(self) -> Qty {
        Qty(self.0.saturating_neg())
    }
}

impl Sum for Qty {
    fn sum<I: Iterator<Item = Qty>>(iter: I) -> Qty {
        iter.fold(Qty::ZERO, |acc, q| acc + q)
    }
}

// ==========================================
// BufferFactor - 工序缓冲系数
// ==========================================
// 例: 1.100 表示预期 10% 良率损失补偿
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferFactor(i64);

impl BufferFactor {
    pub const ONE: BufferFactor = BufferFactor(1000);

    pub const fn from_milli(milli: i64) -> Self {
        BufferFactor(milli)
    }

    pub const fn milli(self) -> i64 {
        self.0
    }
}

impl fmt::Display for BufferFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Qty::from_milli(self.0).fmt(f)
    }
}

impl FromStr for BufferFactor {
    type Err = QtyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let q: Qty = s.parse()?;
        if !q.is_positive() {
            return Err(QtyParseError::Malformed(s.to_string()));
        }
        Ok(BufferFactor(q.milli()))
    }
}

// ==========================================
// 数量运算
// ==========================================

/// i128 中间结果收回 i64（饱和）
fn saturate(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn ceil_div_i128(num: i128, den: i128) -> i128 {
    let q = num.div_euclid(den);
    if num.rem_euclid(den) == 0 {
        q
    } else {
        q + 1
    }
}

/// 计算缓冲后目标件数
///
/// target = requested × Π(factors)，结果截断为整件
pub fn buffered_target(requested: Qty, factors: &[BufferFactor]) -> Qty {
    let one = BufferFactor::ONE.milli() as i128;
    let mut num: i128 = requested.milli() as i128;
    let mut den: i128 = 1;
    for f in factors {
        let f = f.milli() as i128;
        // 连乘将溢出 i128 时先按当前分母约简
        if num.checked_mul(f).is_none() || den.checked_mul(one).is_none() {
            num = num.div_euclid(den);
            den = 1;
        }
        num = num.saturating_mul(f);
        den *= one;
    }
    Qty::from_milli(saturate(num.div_euclid(den))).floor_units()
}

/// 计算物料需求量
///
/// need = output × qty_per_unit × (1 + wastage%)，向上取整到物料计量单位
///
/// # 参数
/// - output: 产出件数
/// - qty_per_unit: 单件用量
/// - wastage_pct: 损耗百分比（0-100，千分位精度）
/// - unit_step: 物料最小计量单位
pub fn material_need(output: Qty, qty_per_unit: Qty, wastage_pct: Qty, unit_step: Qty) -> Qty {
    let hundred_pct = Qty::from_units(100).milli() as i128;
    let num = (output.milli() as i128)
        .saturating_mul(qty_per_unit.milli() as i128)
        .saturating_mul(hundred_pct + wastage_pct.milli() as i128);
    let den = Qty::SCALE as i128 * hundred_pct;
    Qty::from_milli(saturate(ceil_div_i128(num, den))).ceil_to_step(unit_step)
}

/// 交接数量差异是否超出容差
///
/// 判定: |received − sent| / sent > tolerance_pct（恰好等于容差视为通过）
pub fn exceeds_tolerance(sent: Qty, received: Qty, tolerance_pct: Qty) -> bool {
    if !sent.is_positive() {
        return received != sent;
    }
    let diff = (received - sent).abs().milli() as i128;
    let hundred_pct = Qty::from_units(100).milli() as i128;
    diff * hundred_pct > sent.milli() as i128 * tolerance_pct.milli() as i128
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Qty {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(q("12.5").milli(), 12_500);
        assert_eq!(q("0.001").milli(), 1);
        assert_eq!(q("-3").milli(), -3_000);
        assert_eq!(q(".25").milli(), 250);
        assert_eq!(Qty::from_milli(-40_500).to_string(), "-40.500");
        assert_eq!(Qty::from_units(577).to_string(), "577.000");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!("1.2345".parse::<Qty>(), Err(QtyParseError::TooPrecise(_))));
        assert!("abc".parse::<Qty>().is_err());
        assert!("".parse::<Qty>().is_err());
        assert!("-".parse::<Qty>().is_err());
        assert!("0".parse::<BufferFactor>().is_err());
    }

    #[test]
    fn test_buffered_target_truncates_to_whole_pieces() {
        let f = |s: &str| s.parse::<BufferFactor>().unwrap();
        let requested = Qty::from_units(500);

        assert_eq!(buffered_target(requested, &[f("1.10")]), Qty::from_units(550));
        assert_eq!(
            buffered_target(requested, &[f("1.10"), f("1.05")]),
            Qty::from_units(577)
        );
        assert_eq!(
            buffered_target(requested, &[f("1.10"), f("1.05"), f("1.00")]),
            Qty::from_units(577)
        );
        assert_eq!(buffered_target(requested, &[]), requested);
    }

    #[test]
    fn test_material_need_rounds_up() {
        // 550 件 × 0.35 m × 1.05 = 202.125 m，按 0.1 m 计量 → 202.2 m
        let need = material_need(Qty::from_units(550), q("0.35"), q("5"), q("0.1"));
        assert_eq!(need, q("202.2"));

        // 按件计量的辅料: 550 × 2 × 1.02 = 1122 粒
        let eyes = material_need(Qty::from_units(550), q("2"), q("2"), q("1"));
        assert_eq!(eyes, Qty::from_units(1122));

        // 1 件 × 0.001 × 1.333 = 0.001333 → 向上取千分位 0.002
        let tiny = material_need(Qty::from_units(1), q("0.001"), q("33.3"), q("0.001"));
        assert_eq!(tiny, q("0.002"));
    }

    #[test]
    fn test_exceeds_tolerance() {
        let ten = Qty::from_units(10);
        assert!(exceeds_tolerance(Qty::from_units(100), Qty::from_units(80), ten));
        assert!(!exceeds_tolerance(Qty::from_units(100), Qty::from_units(90), ten));
        assert!(!exceeds_tolerance(Qty::from_units(100), Qty::from_units(110), ten));
        assert!(exceeds_tolerance(Qty::from_units(100), q("110.001"), ten));
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert_eq!(q("1000000000"), Qty::MAX);
        assert!(matches!(
            "1000000000.001".parse::<Qty>(),
            Err(QtyParseError::OutOfRange { .. })
        ));
        assert!(matches!(
            "-1000000001".parse::<Qty>(),
            Err(QtyParseError::OutOfRange { .. })
        ));
        assert!("99999999999999999999".parse::<Qty>().is_err());
        assert!(Qty::from_milli(i64::MAX).exceeds_limit());
        assert!(!Qty::MAX.exceeds_limit());
    }

    #[test]
    fn test_arithmetic_saturates_instead_of_wrapping() {
        let big = Qty::from_milli(i64::MAX - 1);
        assert_eq!(big + Qty::from_units(1), Qty::from_milli(i64::MAX));
        assert_eq!(-big - Qty::from_units(5), Qty::from_milli(i64::MIN));
        assert_eq!(-Qty::from_milli(i64::MIN), Qty::from_milli(i64::MAX));
        assert_eq!(Qty::from_milli(i64::MIN).abs(), Qty::from_milli(i64::MAX));
        assert_eq!(Qty::from_units(i64::MAX), Qty::from_milli(i64::MAX));
        assert_eq!(big.checked_add(Qty::from_units(1)), None);

        let mut acc = big;
        acc += Qty::from_units(10);
        assert_eq!(acc, Qty::from_milli(i64::MAX));
        acc = Qty::from_milli(i64::MIN + 1);
        acc -= Qty::from_units(10);
        assert_eq!(acc, Qty::from_milli(i64::MIN));
        assert!(Qty::from_milli(i64::MIN).floor_units() <= Qty::ZERO);
    }

    #[test]
    fn test_large_inputs_do_not_overflow_derivations() {
        let f = |s: &str| s.parse::<BufferFactor>().unwrap();
        let factors = vec![f("1000"); 20];
        let target = buffered_target(Qty::MAX, &factors);
        assert_eq!(target, Qty::from_milli(i64::MAX).floor_units());

        let need = material_need(Qty::MAX, Qty::MAX, q("100"), q("0.1"));
        assert!(need.is_positive());
        assert!(need >= Qty::from_milli(i64::MAX - 1_000));

        let stepped = Qty::from_milli(i64::MAX - 1).ceil_to_step(q("7"));
        assert_eq!(stepped, Qty::from_milli(i64::MAX));
    }

    #[test]
    fn test_ceil_and_floor() {
        assert_eq!(q("2.4").ceil_to_step(q("1")), q("3"));
        assert_eq!(q("2").ceil_to_step(q("1")), q("2"));
        assert_eq!(q("577.5").floor_units(), q("577"));
        assert!(q("3").is_whole_units());
        assert!(!q("3.5").is_whole_units());
    }
}
