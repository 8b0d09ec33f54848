//! 向量相似度存储契约与内存实现

use async_trait::async_trait;
use flux_scene_core::{FusionError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// k 近邻结果
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub uuid: String,
    pub rv_id: u64,
    pub distance: f64,
}

/// 外部向量存储
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// 创建描述子集合
    async fn add_schema(&self, set_name: &str, metric: &str, dimensions: usize) -> Result<()>;

    async fn find_schema(&self, set_name: &str) -> Result<bool>;

    /// 写入一个身份的一批描述子
    async fn add_entry(
        &self,
        set_name: &str,
        uuid: &str,
        rv_id: u64,
        category: &str,
        vectors: &[Vec<f32>],
    ) -> Result<()>;

    /// 每个查询向量返回同类别下最近的 k 个描述子
    async fn find_similarity_scores(
        &self,
        set_name: &str,
        category: &str,
        vectors: &[Vec<f32>],
        k: usize,
    ) -> Result<Vec<Vec<Neighbor>>>;
}

#[derive(Debug, Clone)]
struct Descriptor {
    uuid: String,
    rv_id: u64,
    category: String,
    vector: Vec<f32>,
}

#[derive(Debug, Default)]
struct DescriptorSet {
    dimensions: usize,
    entries: Vec<Descriptor>,
}

/// 进程内 L2 暴力检索
#[derive(Default, Clone)]
pub struct InMemoryVectorStore {
    sets: Arc<RwLock<HashMap<String, DescriptorSet>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, set_name: &str) -> usize {
        self.sets.read().get(set_name).map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, set_name: &str) -> bool {
        self.len(set_name) == 0
    }
}

fn l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (*x as f64) - (*y as f64);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn add_schema(&self, set_name: &str, metric: &str, dimensions: usize) -> Result<()> {
        if metric != "L2" {
            return Err(FusionError::store(format!("unsupported metric {metric}")));
        }
        self.sets
            .write()
            .entry(set_name.to_string())
            .or_insert_with(|| DescriptorSet { dimensions, entries: Vec::new() });
        Ok(())
    }

    async fn find_schema(&self, set_name: &str) -> Result<bool> {
        Ok(self.sets.read().contains_key(set_name))
    }

    async fn add_entry(
        &self,
        set_name: &str,
        uuid: &str,
        rv_id: u64,
        category: &str,
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        let mut sets = self.sets.write();
        let set = sets
            .get_mut(set_name)
            .ok_or_else(|| FusionError::store(format!("descriptor set {set_name} missing")))?;
        for vector in vectors {
            if vector.len() != set.dimensions {
                return Err(FusionError::store(format!(
                    "descriptor has {} dimensions, set expects {}",
                    vector.len(),
                    set.dimensions
                )));
            }
            set.entries.push(Descriptor {
                uuid: uuid.to_string(),
                rv_id,
                category: category.to_string(),
                vector: vector.clone(),
            });
        }
        Ok(())
    }

    async fn find_similarity_scores(
        &self,
        set_name: &str,
        category: &str,
        vectors: &[Vec<f32>],
        k: usize,
    ) -> Result<Vec<Vec<Neighbor>>> {
        let sets = self.sets.read();
        let set = sets
            .get(set_name)
            .ok_or_else(|| FusionError::store(format!("descriptor set {set_name} missing")))?;
        let results = vectors
            .iter()
            .map(|query| {
                let mut neighbors: Vec<Neighbor> = set
                    .entries
                    .iter()
                    .filter(|d| d.category == category)
                    .map(|d| Neighbor {
                        uuid: d.uuid.clone(),
                        rv_id: d.rv_id,
                        distance: l2(query, &d.vector),
                    })
                    .collect();
                neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));
                neighbors.truncate(k);
                neighbors
            })
            .collect();
        Ok(results)
    }
}
