//! The closed token set, their decimals, and CEX trading-pair resolution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A token identifier drawn from the closed set the controller understands.
///
/// `Btc` and `BtcLn` denote the same underlying asset over different rails: on-chain vs.
/// Lightning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Token {
    Btc,
    BtcLn,
    Usdc,
    Usdt,
    Eth,
    Sol,
}

impl Token {
    pub const ALL: [Token; 6] = [
        Token::Btc,
        Token::BtcLn,
        Token::Usdc,
        Token::Usdt,
        Token::Eth,
        Token::Sol,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Token::Btc => "BTC",
            Token::BtcLn => "BTC-LN",
            Token::Usdc => "USDC",
            Token::Usdt => "USDT",
            Token::Eth => "ETH",
            Token::Sol => "SOL",
        }
    }

    pub fn is_btc_like(&self) -> bool {
        matches!(self, Token::Btc | Token::BtcLn)
    }

    pub fn is_smart_chain(&self) -> bool {
        !self.is_btc_like()
    }

    /// Fixed decimal count per the currency table in §6. `USDC`/`USDT` decimals differ per venue
    /// (6 on venue A, 18 on venue B); callers needing the venue-specific value should consult the
    /// `Exchange` adapter instead of this table for those two tokens when precision matters at
    /// the CEX boundary. This table gives the on-chain/Lightning decimals used everywhere else.
    pub fn decimals(&self) -> i32 {
        match self {
            Token::Btc | Token::BtcLn => 8,
            Token::Usdc | Token::Usdt => 6,
            Token::Eth => 18,
            Token::Sol => 9,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Token {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Token::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl FromStr for Token {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTC" => Ok(Token::Btc),
            "BTC-LN" => Ok(Token::BtcLn),
            "USDC" => Ok(Token::Usdc),
            "USDT" => Ok(Token::Usdt),
            "ETH" => Ok(Token::Eth),
            "SOL" => Ok(Token::Sol),
            other => Err(format!("unknown token {other}")),
        }
    }
}

/// Whether a CEX market order buys or sells the base asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn flip(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// A resolved CEX instrument for a `(src, dst)` rebalance direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradingPair {
    /// The venue instrument string, e.g. `"BTC-USDC"`.
    pub pair: String,
    pub side: Side,
}

/// Resolves `(src, dst)` to a CEX instrument and buy/sell flag.
///
/// Exactly one side of every supported pair is BTC-like. If BTC is the base asset (`BTCxxx`),
/// selling moves value from BTC to `xxx`; if BTC is the quote asset (`xxxBTC`), the sense
/// reverses. Trading pair mapping is an involution: `get_trading_pair(src, dst).pair ==
/// get_trading_pair(dst, src).pair` and their `side`s are complements.
pub fn get_trading_pair(src: Token, dst: Token) -> Result<TradingPair, String> {
    if src == dst {
        return Err(format!("src and dst are both {src}"));
    }
    if !src.is_btc_like() && !dst.is_btc_like() {
        return Err(format!("no BTC leg in pair {src}/{dst}"));
    }

    // BTC is always on one side; determine whether it's base (`BTCxxx`) or quote (`xxxBTC`).
    let (btc_is_base, other) = if src.is_btc_like() {
        (matches!(dst, Token::Usdc | Token::Usdt), dst)
    } else {
        (matches!(src, Token::Usdc | Token::Usdt), src)
    };

    let pair = if btc_is_base {
        format!("BTC-{other}")
    } else {
        format!("{other}-BTC")
    };

    // Moving *from* BTC: sell if BTC is base, buy if BTC is quote. Moving *to* BTC: the reverse.
    let moving_from_btc = src.is_btc_like();
    let side = match (btc_is_base, moving_from_btc) {
        (true, true) => Side::Sell,
        (true, false) => Side::Buy,
        (false, true) => Side::Buy,
        (false, false) => Side::Sell,
    };

    Ok(TradingPair { pair, side })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trading_pair_mapping_is_an_involution() {
        let pairs = [
            (Token::Btc, Token::Usdc),
            (Token::Btc, Token::Usdt),
            (Token::Eth, Token::Btc),
            (Token::Sol, Token::Btc),
            (Token::BtcLn, Token::Usdc),
        ];
        for (a, b) in pairs {
            let fwd = get_trading_pair(a, b).unwrap();
            let bwd = get_trading_pair(b, a).unwrap();
            assert_eq!(fwd.pair, bwd.pair, "{a}/{b} pair mismatch");
            assert_eq!(fwd.side, bwd.side.flip(), "{a}/{b} side not complementary");
        }
    }

    #[test]
    fn unknown_pair_without_a_btc_leg_fails() {
        assert!(get_trading_pair(Token::Usdc, Token::Eth).is_err());
    }

    #[test]
    fn base_quote_orientation_matches_spec_table() {
        assert_eq!(get_trading_pair(Token::Btc, Token::Usdc).unwrap().pair, "BTC-USDC");
        assert_eq!(get_trading_pair(Token::Eth, Token::Btc).unwrap().pair, "ETH-BTC");
        assert_eq!(get_trading_pair(Token::Sol, Token::Btc).unwrap().pair, "SOL-BTC");
    }
}
