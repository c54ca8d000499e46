//! Machine modes attached to RTL expressions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An x86 machine mode. The mode determines the byte width of the value an
/// expression produces; condition-code and block modes exist only so lifted
/// trees round-trip.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Mode {
    Qi,
    Hi,
    Si,
    Di,
    Ti,
    Sf,
    Df,
    Xf,
    Tf,
    Fsqi,
    Fshi,
    Fssi,
    Fsdi,
    Blk,
    Blkqi,
    Blkhi,
    Blksi,
    Blkdi,
    Cc,
    Ccz,
    Ccc,
    Cco,
    Ccno,
    Ccgc,
    Ccgoc,
    Ccfp,
    V1di,
    V1ti,
    V2df,
    V2di,
    V2sf,
    V2si,
    V4di,
    V4sf,
    V4si,
    V8hi,
    V8qi,
    V8sf,
    V8si,
    V16hi,
    V16qi,
    V32qi,
    None,
}

const MODE_TABLE: [(Mode, &str, u8); 43] = [
    (Mode::Qi, "QI", 1),
    (Mode::Hi, "HI", 2),
    (Mode::Si, "SI", 4),
    (Mode::Di, "DI", 8),
    (Mode::Ti, "TI", 16),
    (Mode::Sf, "SF", 4),
    (Mode::Df, "DF", 8),
    (Mode::Xf, "XF", 10),
    (Mode::Tf, "TF", 16),
    (Mode::Fsqi, "FSQI", 1),
    (Mode::Fshi, "FSHI", 2),
    (Mode::Fssi, "FSSI", 4),
    (Mode::Fsdi, "FSDI", 8),
    (Mode::Blk, "BLK", 8),
    (Mode::Blkqi, "BLKQI", 1),
    (Mode::Blkhi, "BLKHI", 2),
    (Mode::Blksi, "BLKSI", 4),
    (Mode::Blkdi, "BLKDI", 8),
    (Mode::Cc, "CC", 8),
    (Mode::Ccz, "CCZ", 8),
    (Mode::Ccc, "CCC", 8),
    (Mode::Cco, "CCO", 8),
    (Mode::Ccno, "CCNO", 8),
    (Mode::Ccgc, "CCGC", 8),
    (Mode::Ccgoc, "CCGOC", 8),
    (Mode::Ccfp, "CCFP", 8),
    (Mode::V1di, "V1DI", 8),
    (Mode::V1ti, "V1TI", 16),
    (Mode::V2df, "V2DF", 16),
    (Mode::V2di, "V2DI", 16),
    (Mode::V2sf, "V2SF", 8),
    (Mode::V2si, "V2SI", 8),
    (Mode::V4di, "V4DI", 32),
    (Mode::V4sf, "V4SF", 16),
    (Mode::V4si, "V4SI", 16),
    (Mode::V8hi, "V8HI", 16),
    (Mode::V8qi, "V8QI", 8),
    (Mode::V8sf, "V8SF", 32),
    (Mode::V8si, "V8SI", 32),
    (Mode::V16hi, "V16HI", 32),
    (Mode::V16qi, "V16QI", 16),
    (Mode::V32qi, "V32QI", 32),
    (Mode::None, "", 0),
];

impl Mode {
    /// Byte width of a value in this mode.
    pub fn size(&self) -> u8 {
        MODE_TABLE
            .iter()
            .find(|(m, _, _)| m == self)
            .map(|(_, _, s)| *s)
            .unwrap_or(0)
    }

    /// Parse the mode suffix of a lifted token (`DI` in `reg:DI`).
    pub fn from_suffix(s: &str) -> Option<Mode> {
        MODE_TABLE
            .iter()
            .find(|(m, n, _)| !n.is_empty() && *n == s || (*m == Mode::None && s.is_empty()))
            .map(|(m, _, _)| *m)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = MODE_TABLE
            .iter()
            .find(|(m, _, _)| m == self)
            .map(|(_, n, _)| *n)
            .unwrap_or("");
        if name.is_empty() {
            Ok(())
        } else {
            write!(f, ":{}", name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_sizes() {
        assert_eq!(Mode::Qi.size(), 1);
        assert_eq!(Mode::Di.size(), 8);
        assert_eq!(Mode::Xf.size(), 10);
        assert_eq!(Mode::V32qi.size(), 32);
        assert_eq!(Mode::None.size(), 0);
    }

    #[test]
    fn mode_suffix_parse() {
        assert_eq!(Mode::from_suffix("DI"), Some(Mode::Di));
        assert_eq!(Mode::from_suffix("CCGOC"), Some(Mode::Ccgoc));
        assert_eq!(Mode::from_suffix("V2SF"), Some(Mode::V2sf));
        assert_eq!(Mode::from_suffix("ZZ"), None);
    }

    #[test]
    fn mode_display() {
        assert_eq!(Mode::Di.to_string(), ":DI");
        assert_eq!(Mode::None.to_string(), "");
    }
}
