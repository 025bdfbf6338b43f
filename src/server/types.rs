use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::model::{QueryMode, SearchResult};

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    pub file: Option<Bytes>,
    pub text: Option<String>,
    pub top_k: Option<usize>,
    pub mode: Option<String>,
    pub distance_threshold: Option<f32>,
    pub fusion_weight: Option<f32>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 上传的图片文件，向量与混合查询必填
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: Option<String>,
    /// 查询文本，为空时由图片描述生成
    pub text: Option<String>,
    /// 返回的结果数量
    #[schema(default = 10)]
    pub top_k: Option<usize>,
    /// 查询模式
    #[schema(value_type = Option<QueryMode>)]
    pub mode: Option<String>,
    /// 向量距离阈值
    pub distance_threshold: Option<f32>,
    /// 向量信号的权重，范围从 0 到 1
    pub fusion_weight: Option<f32>,
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u64,
    pub mode: QueryMode,
    pub result: Vec<SearchResult>,
}

/// 导入服务器本地目录或归档文件
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddRequest {
    pub path: String,
}
