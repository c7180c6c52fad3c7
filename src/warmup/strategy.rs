use crate::keys::DataCategory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What to pre-load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStrategy {
    HotProducts,
    HotCategories,
    ActiveUsers,
    PopularSearches,
}

impl WarmupStrategy {
    pub const ALL: [Self; 4] = [
        Self::HotProducts,
        Self::HotCategories,
        Self::ActiveUsers,
        Self::PopularSearches,
    ];

    /// Entity kind used to build the cache key of each warmed entity
    #[must_use]
    pub fn entity_kind(&self) -> &'static str {
        match self {
            Self::HotProducts => "product",
            Self::HotCategories => "category",
            Self::ActiveUsers => "user",
            Self::PopularSearches => "search",
        }
    }

    #[must_use]
    pub fn category(&self) -> DataCategory {
        DataCategory::from_entity_kind(self.entity_kind())
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HotProducts => "hot_products",
            Self::HotCategories => "hot_categories",
            Self::ActiveUsers => "active_users",
            Self::PopularSearches => "popular_searches",
        }
    }
}

/// Popularity signals for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetrics {
    pub id: String,
    /// Units sold (or the strategy's equivalent activity count)
    pub sales: u64,
    pub views: u64,
    pub rating: f64,
    pub last_active: DateTime<Utc>,
}

/// Supplies warmup candidates and their records
#[async_trait]
pub trait WarmupSource: Send + Sync {
    /// Every entity that could be worth warming for `strategy`
    async fn candidates(&self, strategy: WarmupStrategy) -> anyhow::Result<Vec<EntityMetrics>>;

    /// Current record for one candidate, `None` if it disappeared meanwhile
    async fn load(&self, strategy: WarmupStrategy, id: &str) -> anyhow::Result<Option<Value>>;
}
