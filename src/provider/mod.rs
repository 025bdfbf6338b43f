//! 图片特征服务：向量与描述

use std::future::Future;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

mod local;
mod remote;

pub use local::LocalEmbedder;
pub use remote::{
    ChatCaptioner, ChatCaptionerConfig, DEFAULT_CAPTION_MODEL, DEFAULT_CHAT_BASE_URL,
    DEFAULT_EMBEDDING_ENDPOINT, DEFAULT_EMBEDDING_MODEL, RemoteEmbedder, RemoteEmbedderConfig,
};

use crate::error::ProviderError;

/// 图片 → 定长向量
pub trait EmbeddingProvider: Send + Sync {
    /// 输出向量的维度
    fn dimension(&self) -> usize;

    fn embed(&self, image: &[u8]) -> impl Future<Output = Result<Vec<f32>, ProviderError>> + Send;
}

/// 图片 → 简短描述
pub trait CaptionProvider: Send + Sync {
    fn caption(&self, image: &[u8]) -> impl Future<Output = Result<String, ProviderError>> + Send;
}

/// 构造时选定的向量后端
pub enum Embedder {
    Remote(RemoteEmbedder),
    Local(LocalEmbedder),
}

impl EmbeddingProvider for Embedder {
    fn dimension(&self) -> usize {
        match self {
            Self::Remote(e) => e.dimension(),
            Self::Local(e) => e.dimension(),
        }
    }

    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>, ProviderError> {
        match self {
            Self::Remote(e) => e.embed(image).await,
            Self::Local(e) => e.embed(image).await,
        }
    }
}

/// 根据文件头识别的图片格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
    Bmp,
}

impl ImageFormat {
    pub fn sniff(data: &[u8]) -> Option<Self> {
        match data {
            [0xff, 0xd8, 0xff, ..] => Some(Self::Jpeg),
            [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, ..] => Some(Self::Png),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(Self::Webp),
            [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(Self::Gif),
            [b'B', b'M', ..] if data.len() > 26 => Some(Self::Bmp),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
        }
    }
}

/// 将图片编码为 data URL，无法识别的数据直接拒绝
pub fn data_url(image: &[u8]) -> Result<String, ProviderError> {
    let format = ImageFormat::sniff(image)
        .ok_or_else(|| ProviderError::InvalidImage("无法识别的图片格式".to_string()))?;
    Ok(format!("data:{};base64,{}", format.mime(), STANDARD.encode(image)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff() {
        assert_eq!(ImageFormat::sniff(&[0xff, 0xd8, 0xff, 0xe0, 0, 0]), Some(ImageFormat::Jpeg));
        assert_eq!(
            ImageFormat::sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(ImageFormat::Png)
        );
        assert_eq!(ImageFormat::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::sniff(b"GIF89a\x01\0"), Some(ImageFormat::Gif));
        assert_eq!(ImageFormat::sniff(b"not an image"), None);
        assert_eq!(ImageFormat::sniff(&[]), None);
    }

    #[test]
    fn test_data_url() {
        let url = data_url(&[0xff, 0xd8, 0xff, 0xe0]).unwrap();
        assert_eq!(url, "data:image/jpeg;base64,/9j/4A==");
        assert!(matches!(data_url(b"hello"), Err(ProviderError::InvalidImage(_))));
    }
}
