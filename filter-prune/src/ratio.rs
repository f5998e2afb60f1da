use crate::common::*;

/// The fraction of filters removed from each pruned layer, within `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CutRatio(R64);

impl CutRatio {
    pub fn to_f64(&self) -> f64 {
        self.0.raw()
    }

    /// The number of filters to remove from a layer with `out_channels` filters.
    ///
    /// It is `floor(ratio * out_channels)`, clamped so that at least one
    /// filter survives.
    pub fn num_filters(&self, out_channels: usize) -> usize {
        if out_channels == 0 {
            return 0;
        }
        let count = (self.0.raw() * out_channels as f64).floor() as usize;
        count.min(out_channels - 1)
    }
}

impl Default for CutRatio {
    fn default() -> Self {
        Self(r64(0.2))
    }
}

impl Serialize for CutRatio {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CutRatio {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Self::try_from(value).map_err(|err| D::Error::custom(format!("{:?}", err)))
    }
}

impl PartialEq<f64> for CutRatio {
    fn eq(&self, other: &f64) -> bool {
        self.0.raw() == *other
    }
}

impl AbsDiffEq<f64> for CutRatio {
    type Epsilon = f64;

    fn default_epsilon() -> Self::Epsilon {
        f64::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &f64, epsilon: Self::Epsilon) -> bool {
        self.0.raw().abs_diff_eq(other, epsilon)
    }
}

impl TryFrom<R64> for CutRatio {
    type Error = Error;

    fn try_from(value: R64) -> Result<Self, Self::Error> {
        ensure!(
            (0.0..1.0).contains(&value.raw()),
            "cut ratio must be within range [0.0, 1.0), but get {}",
            value
        );
        Ok(Self(value))
    }
}

impl TryFrom<f64> for CutRatio {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::try_from(R64::try_new(value).ok_or_else(|| format_err!("not a finite value"))?)
    }
}

impl From<CutRatio> for R64 {
    fn from(ratio: CutRatio) -> Self {
        ratio.0
    }
}

impl From<CutRatio> for f64 {
    fn from(ratio: CutRatio) -> Self {
        ratio.0.raw()
    }
}

impl Display for CutRatio {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.to_f64().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn cut_ratio_range() -> Result<()> {
        assert!(CutRatio::try_from(0.0).is_ok());
        assert!(CutRatio::try_from(0.999).is_ok());
        assert!(CutRatio::try_from(1.0).is_err());
        assert!(CutRatio::try_from(-0.1).is_err());
        assert!(CutRatio::try_from(f64::NAN).is_err());

        let ratio: CutRatio = serde_json::from_str("0.25")?;
        assert_abs_diff_eq!(ratio, 0.25);
        assert!(serde_json::from_str::<CutRatio>("1.5").is_err());
        Ok(())
    }

    #[test]
    fn num_filters_floors_and_clamps() -> Result<()> {
        assert_eq!(CutRatio::try_from(0.2)?.num_filters(128), 25);
        assert_eq!(CutRatio::try_from(0.25)?.num_filters(64), 16);
        assert_eq!(CutRatio::try_from(0.0)?.num_filters(64), 0);
        assert_eq!(CutRatio::try_from(0.999)?.num_filters(64), 63);
        assert_eq!(CutRatio::try_from(0.9999)?.num_filters(2), 1);
        assert_eq!(CutRatio::try_from(0.5)?.num_filters(1), 0);
        assert_eq!(CutRatio::try_from(0.5)?.num_filters(0), 0);
        Ok(())
    }
}
