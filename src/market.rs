//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 市场与交易状态
//!
//! 提供代码到市场的推断、市场状态查询接口，以及后台刷新优先级的市场权重。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 交易市场
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    US,
    HK,
    SH,
    SZ,
    Other,
}

impl Market {
    /// 市场基础权重（主要市场更高）
    pub fn base_weight(&self) -> u32 {
        match self {
            Market::US | Market::HK => 3,
            Market::SH | Market::SZ => 2,
            Market::Other => 1,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Market::US => "US",
            Market::HK => "HK",
            Market::SH => "SH",
            Market::SZ => "SZ",
            Market::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// 交易状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingStatus {
    PreMarket,
    Trading,
    LunchBreak,
    AfterHours,
    Closed,
    Holiday,
}

impl TradingStatus {
    /// 行情是否仍在变动
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TradingStatus::Trading | TradingStatus::PreMarket | TradingStatus::AfterHours
        )
    }
}

/// 市场状态提供方返回的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatusReport {
    pub status: TradingStatus,
    /// 置信度 [0, 1]
    pub confidence: f64,
}

/// 市场状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatusSnapshot {
    pub market: Market,
    pub status: TradingStatus,
    pub confidence: f64,
    pub queried_at: DateTime<Utc>,
}

impl MarketStatusSnapshot {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// 市场状态提供方
#[async_trait]
pub trait MarketStatusProvider: Send + Sync {
    /// 查询市场当前状态
    async fn get_market_status(&self, market: Market) -> anyhow::Result<MarketStatusReport>;
}

/// 固定状态提供方（测试、离线环境使用）
#[derive(Debug, Clone, Default)]
pub struct StaticMarketStatusProvider {
    statuses: HashMap<Market, TradingStatus>,
    fallback: Option<TradingStatus>,
}

impl StaticMarketStatusProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有市场使用同一状态
    pub fn all(status: TradingStatus) -> Self {
        Self {
            statuses: HashMap::new(),
            fallback: Some(status),
        }
    }

    pub fn with_status(mut self, market: Market, status: TradingStatus) -> Self {
        self.statuses.insert(market, status);
        self
    }
}

#[async_trait]
impl MarketStatusProvider for StaticMarketStatusProvider {
    async fn get_market_status(&self, market: Market) -> anyhow::Result<MarketStatusReport> {
        let status = self
            .statuses
            .get(&market)
            .copied()
            .or(self.fallback)
            .ok_or_else(|| anyhow::anyhow!("未配置市场 {} 的状态", market))?;
        Ok(MarketStatusReport {
            status,
            confidence: 1.0,
        })
    }
}

/// 代码到市场的推断
pub trait MarketInferrer: Send + Sync {
    fn infer_market(&self, symbol: &str) -> Market;
}

/// 基于后缀和代码格式的推断
///
/// - `.HK` 或5位纯数字 -> HK
/// - `.SH` / `.SS` 或 `60`、`68` 开头的6位数字 -> SH
/// - `.SZ` 或 `00`、`30` 开头的6位数字 -> SZ
/// - 其他 -> US
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixMarketInferrer;

impl MarketInferrer for SuffixMarketInferrer {
    fn infer_market(&self, symbol: &str) -> Market {
        let symbol = symbol.trim().to_uppercase();

        if let Some((_, suffix)) = symbol.rsplit_once('.') {
            match suffix {
                "HK" => return Market::HK,
                "SH" | "SS" => return Market::SH,
                "SZ" => return Market::SZ,
                "US" => return Market::US,
                _ => {}
            }
        }

        let all_digits = !symbol.is_empty() && symbol.chars().all(|c| c.is_ascii_digit());
        if all_digits {
            match symbol.len() {
                5 => return Market::HK,
                6 if symbol.starts_with("60") || symbol.starts_with("68") => return Market::SH,
                6 if symbol.starts_with("00") || symbol.starts_with("30") => return Market::SZ,
                _ => return Market::Other,
            }
        }

        Market::US
    }
}

/// 计算后台刷新优先级
///
/// 每个代码贡献所属市场的基础权重，开市时翻倍。只用于排序，不影响正确性。
pub fn update_priority<'a>(
    symbols: impl IntoIterator<Item = &'a str>,
    inferrer: &dyn MarketInferrer,
    open_markets: &dyn Fn(Market) -> bool,
) -> u32 {
    symbols
        .into_iter()
        .map(|symbol| {
            let market = inferrer.infer_market(symbol);
            let weight = market.base_weight();
            if open_markets(market) {
                weight * 2
            } else {
                weight
            }
        })
        .fold(0u32, |acc, w| acc.saturating_add(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_market() {
        let inferrer = SuffixMarketInferrer;
        assert_eq!(inferrer.infer_market("AAPL"), Market::US);
        assert_eq!(inferrer.infer_market("0700.HK"), Market::HK);
        assert_eq!(inferrer.infer_market("00700"), Market::HK);
        assert_eq!(inferrer.infer_market("600519.SH"), Market::SH);
        assert_eq!(inferrer.infer_market("600519.ss"), Market::SH);
        assert_eq!(inferrer.infer_market("688001"), Market::SH);
        assert_eq!(inferrer.infer_market("000001.SZ"), Market::SZ);
        assert_eq!(inferrer.infer_market("300750"), Market::SZ);
        assert_eq!(inferrer.infer_market("123"), Market::Other);
        assert_eq!(inferrer.infer_market("BRK.B"), Market::US);
    }

    #[test]
    fn test_trading_status_is_open() {
        assert!(TradingStatus::Trading.is_open());
        assert!(TradingStatus::PreMarket.is_open());
        assert!(TradingStatus::AfterHours.is_open());
        assert!(!TradingStatus::LunchBreak.is_open());
        assert!(!TradingStatus::Closed.is_open());
        assert!(!TradingStatus::Holiday.is_open());
    }

    #[test]
    fn test_update_priority_weights_open_markets() {
        let inferrer = SuffixMarketInferrer;
        let closed = update_priority(["AAPL", "600519.SH"], &inferrer, &|_| false);
        assert_eq!(closed, 3 + 2);

        let us_open = update_priority(["AAPL", "600519.SH"], &inferrer, &|m| m == Market::US);
        assert_eq!(us_open, 6 + 2);

        assert_eq!(update_priority([], &inferrer, &|_| true), 0);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticMarketStatusProvider::new().with_status(Market::US, TradingStatus::Trading);
        let report = provider.get_market_status(Market::US).await.unwrap();
        assert_eq!(report.status, TradingStatus::Trading);
        assert!(provider.get_market_status(Market::HK).await.is_err());

        let provider = StaticMarketStatusProvider::all(TradingStatus::Closed);
        let report = provider.get_market_status(Market::SZ).await.unwrap();
        assert_eq!(report.status, TradingStatus::Closed);
    }
}
