use anyhow::Result;
use imgjson_contracts::image_data::ImageData;
use imgjson_contracts::providers::NamedProvider;

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub prompt: String,
    /// Present when the model should describe an image.
    pub image: Option<ImageData>,
    pub temperature: Option<f32>,
    pub max_output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

pub trait TextProvider: NamedProvider + Send + Sync {
    fn complete(&self, request: &TextRequest) -> Result<TextResponse>;
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
    pub aspect_ratio: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub image: ImageData,
    /// The size actually requested from the backend after normalization.
    pub size: String,
    pub warnings: Vec<String>,
}

pub trait ImageProvider: NamedProvider + Send + Sync {
    fn generate(&self, request: &ImageRequest) -> Result<ImageResponse>;

    /// Produces a new image from `input` following `request.prompt`.
    fn edit(&self, request: &ImageRequest, input: &ImageData) -> Result<ImageResponse>;
}
