// ==========================================
// 医院业务价值核算 - 步骤排序键
// ==========================================
// 步骤排序使用精确有理数而非连续整数:
// 在两个已有步骤之间插入新步骤时,无需重新编号其它步骤
// 存储: sort_num / sort_den 两列 (约分后,分母恒为正)
// ==========================================

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// 十进制小数最多支持的位数 (10^18 仍在 i64 范围内)
const MAX_DECIMAL_DIGITS: u32 = 18;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SortKeyError {
    #[error("排序键格式错误: {0}")]
    Malformed(String),

    #[error("排序键分母不能为0")]
    ZeroDenominator,

    #[error("排序键精度耗尽: 无法在 {lower} 与 {upper} 之间继续插入")]
    Exhausted { lower: String, upper: String },
}

/// 精确有理数排序键
#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    num: i64,
    den: i64,
}

fn gcd_i128(mut a: i128, mut b: i128) -> i128 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl SortKey {
    pub fn from_integer(n: i64) -> Self {
        Self { num: n, den: 1 }
    }

    /// 构造并约分
    pub fn new(num: i64, den: i64) -> Result<Self, SortKeyError> {
        Self::from_i128(num as i128, den as i128).ok_or(SortKeyError::ZeroDenominator)
    }

    fn from_i128(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let (mut num, mut den) = if den < 0 { (-num, -den) } else { (num, den) };
        let g = gcd_i128(num, den);
        if g > 1 {
            num /= g;
            den /= g;
        }
        Some(Self {
            num: i64::try_from(num).ok()?,
            den: i64::try_from(den).ok()?,
        })
    }

    /// 解析排序键: 支持 `4` / `4.5` / `-0.25` / `7/3`
    pub fn parse(raw: &str) -> Result<Self, SortKeyError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(SortKeyError::Malformed(raw.to_string()));
        }

        if let Some((n, d)) = s.split_once('/') {
            let num: i64 = n
                .trim()
                .parse()
                .map_err(|_| SortKeyError::Malformed(raw.to_string()))?;
            let den: i64 = d
                .trim()
                .parse()
                .map_err(|_| SortKeyError::Malformed(raw.to_string()))?;
            return Self::new(num, den);
        }

        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(SortKeyError::Malformed(raw.to_string()));
        }
        let digits_ok = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if !digits_ok(int_part) || !digits_ok(frac_part) {
            return Err(SortKeyError::Malformed(raw.to_string()));
        }
        // 去掉尾部无意义的 0,避免无谓占用精度
        let frac_part = frac_part.trim_end_matches('0');
        if frac_part.len() as u32 > MAX_DECIMAL_DIGITS {
            return Err(SortKeyError::Malformed(raw.to_string()));
        }

        let scale = 10i128.pow(frac_part.len() as u32);
        let int_val: i128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| SortKeyError::Malformed(raw.to_string()))?
        };
        let frac_val: i128 = if frac_part.is_empty() {
            0
        } else {
            frac_part
                .parse()
                .map_err(|_| SortKeyError::Malformed(raw.to_string()))?
        };
        let num = int_val
            .checked_mul(scale)
            .and_then(|v| v.checked_add(frac_val))
            .map(|v| if negative { -v } else { v })
            .ok_or_else(|| SortKeyError::Malformed(raw.to_string()))?;
        Self::from_i128(num, scale).ok_or_else(|| SortKeyError::Malformed(raw.to_string()))
    }

    pub fn numerator(&self) -> i64 {
        self.num
    }

    pub fn denominator(&self) -> i64 {
        self.den
    }

    /// 近似浮点值 (仅用于展示/SQL 粗排序)
    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// 两个排序键的中点
    pub fn between(a: SortKey, b: SortKey) -> Result<SortKey, SortKeyError> {
        let num = a.num as i128 * b.den as i128 + b.num as i128 * a.den as i128;
        let den = 2 * a.den as i128 * b.den as i128;
        Self::from_i128(num, den).ok_or_else(|| SortKeyError::Exhausted {
            lower: a.to_string(),
            upper: b.to_string(),
        })
    }

    /// 末尾追加: 向下取整后 +1
    pub fn after(&self) -> SortKey {
        SortKey::from_integer(self.num.div_euclid(self.den).saturating_add(1))
    }

    /// 头部插入: 向上取整后 -1
    pub fn before(&self) -> SortKey {
        let ceil = -((-(self.num as i128)).div_euclid(self.den as i128));
        SortKey::from_integer(i64::try_from(ceil - 1).unwrap_or(i64::MIN))
    }

    /// 从 lower 起在 [lower, upper) 内等距取 count 个排序键
    pub fn spread(lower: SortKey, upper: SortKey, count: usize) -> Result<Vec<SortKey>, SortKeyError> {
        let exhausted = || SortKeyError::Exhausted {
            lower: lower.to_string(),
            upper: upper.to_string(),
        };
        if upper <= lower {
            return Err(exhausted());
        }
        let n = i128::try_from(count).map_err(|_| exhausted())?;
        // lower = a/b, upper = c/d: key_j = (a*d*n + j*(c*b - a*d)) / (b*d*n)
        let (a, b) = (lower.num as i128, lower.den as i128);
        let (c, d) = (upper.num as i128, upper.den as i128);
        let ad = a * d;
        let gap = c * b - ad;
        let den = (b * d).checked_mul(n).ok_or_else(exhausted)?;
        (0..n)
            .map(|j| {
                ad.checked_mul(n)
                    .zip(gap.checked_mul(j))
                    .and_then(|(base, step)| base.checked_add(step))
                    .and_then(|num| Self::from_i128(num, den))
                    .ok_or_else(exhausted)
            })
            .collect()
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.num as i128 * other.den as i128;
        let rhs = other.num as i128 * self.den as i128;
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            return write!(f, "{}", self.num);
        }
        // 分母只含 2 和 5 的因子时可精确写成有限小数
        let mut rest = self.den as i128;
        let (mut twos, mut fives) = (0u32, 0u32);
        while rest % 2 == 0 {
            rest /= 2;
            twos += 1;
        }
        while rest % 5 == 0 {
            rest /= 5;
            fives += 1;
        }
        let digits = twos.max(fives);
        if rest != 1 || digits > MAX_DECIMAL_DIGITS {
            return write!(f, "{}/{}", self.num, self.den);
        }

        let scale = 10i128.pow(digits);
        let scaled = self.num as i128 * (scale / self.den as i128);
        let sign = if scaled < 0 { "-" } else { "" };
        let abs = scaled.abs();
        let frac = format!("{:0width$}", abs % scale, width = digits as usize);
        write!(
            f,
            "{}{}.{}",
            sign,
            abs / scale,
            frac.trim_end_matches('0')
        )
    }
}

impl Serialize for SortKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SortKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SortKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_and_fraction() {
        let k = SortKey::parse("4.5").unwrap();
        assert_eq!((k.numerator(), k.denominator()), (9, 2));
        assert_eq!(k.to_string(), "4.5");

        let k = SortKey::parse("6.00").unwrap();
        assert_eq!((k.numerator(), k.denominator()), (6, 1));
        assert_eq!(k.to_string(), "6");

        let k = SortKey::parse("-0.25").unwrap();
        assert_eq!(k.to_string(), "-0.25");

        let k = SortKey::parse("7/3").unwrap();
        assert_eq!(k.to_string(), "7/3");

        assert!(SortKey::parse("abc").is_err());
        assert!(SortKey::parse("1.2.3").is_err());
        assert!(SortKey::parse("").is_err());
        assert_eq!(SortKey::parse("1/0"), Err(SortKeyError::ZeroDenominator));
    }

    #[test]
    fn test_ordering_is_exact() {
        let a = SortKey::parse("4").unwrap();
        let b = SortKey::parse("4.5").unwrap();
        let c = SortKey::parse("9/2").unwrap();
        assert!(a < b);
        assert_eq!(b, c);
        assert!(SortKey::parse("1/3").unwrap() < SortKey::parse("0.3334").unwrap());
    }

    #[test]
    fn test_between_never_renumbers() {
        let lower = SortKey::parse("5").unwrap();
        let mut upper = SortKey::parse("6").unwrap();
        // 反复在同一位置插入,始终严格落在两者之间
        for _ in 0..40 {
            let mid = SortKey::between(lower, upper).unwrap();
            assert!(lower < mid && mid < upper);
            upper = mid;
        }
        assert_eq!(
            SortKey::between(SortKey::from_integer(5), SortKey::from_integer(6))
                .unwrap()
                .to_string(),
            "5.5"
        );
    }

    #[test]
    fn test_after_and_before() {
        assert_eq!(SortKey::parse("3").unwrap().after().to_string(), "4");
        assert_eq!(SortKey::parse("3.5").unwrap().after().to_string(), "4");
        assert_eq!(SortKey::parse("1").unwrap().before().to_string(), "0");
        assert_eq!(SortKey::parse("0.5").unwrap().before().to_string(), "0");
    }

    #[test]
    fn test_parse_overflow_is_malformed() {
        let raw = "1000000000000000000000.123456789012345678";
        assert_eq!(
            SortKey::parse(raw),
            Err(SortKeyError::Malformed(raw.to_string()))
        );
        let raw = "99999999999999999999999999999999999999";
        assert!(matches!(SortKey::parse(raw), Err(SortKeyError::Malformed(_))));
    }

    #[test]
    fn test_before_saturates_at_min() {
        let min = SortKey::from_integer(i64::MIN);
        assert_eq!(min.before(), min);
        let k = SortKey::new(i64::MIN, 3).unwrap();
        assert!(k.before() < k);
    }

    #[test]
    fn test_spread_keeps_lower_and_stays_below_upper() {
        let keys = SortKey::spread(SortKey::from_integer(3), SortKey::from_integer(5), 4).unwrap();
        let text: Vec<_> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(text, vec!["3", "3.5", "4", "4.5"]);
        assert!(SortKey::spread(SortKey::from_integer(5), SortKey::from_integer(5), 2).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let k = SortKey::parse("4.5").unwrap();
        assert_eq!(serde_json::to_string(&k).unwrap(), "\"4.5\"");
        let back: SortKey = serde_json::from_str("\"9/2\"").unwrap();
        assert_eq!(back, k);
    }
}
