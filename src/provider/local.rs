use super::{EmbeddingProvider, ImageFormat};
use crate::error::ProviderError;

/// 最多采样的字节片段数
const MAX_SHINGLES: usize = 16384;
const SHINGLE_LEN: usize = 8;

/// 本地向量生成，不依赖网络
///
/// 对图片内容的字节片段做特征哈希，再做 L2 归一化。
/// 结果是确定性的：相同内容总是得到相同的向量，内容相近的文件距离也更近。
/// 不具备任何语义能力，只用于离线运行和测试。
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimension: usize,
}

impl LocalEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }

    pub fn embed_bytes(&self, data: &[u8]) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        if data.is_empty() {
            return vector;
        }

        let windows = data.len().saturating_sub(SHINGLE_LEN) + 1;
        let stride = windows.div_ceil(MAX_SHINGLES).max(1);
        for start in (0..windows).step_by(stride) {
            let end = (start + SHINGLE_LEN).min(data.len());
            let hash = blake3::hash(&data[start..end]);
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes(bytes[..8].try_into().unwrap_or_default());
            // 用另一个字节的最低位决定符号，减少哈希碰撞带来的偏差
            let sign = if bytes[8] & 1 == 0 { 1. } else { -1. };
            vector[(bucket % self.dimension as u64) as usize] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0. {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl EmbeddingProvider for LocalEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>, ProviderError> {
        if ImageFormat::sniff(image).is_none() {
            return Err(ProviderError::InvalidImage("无法识别的图片格式".to_string()));
        }
        Ok(self.embed_bytes(image))
    }
}
