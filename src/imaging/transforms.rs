// 画像変換の具象実装
// 読み込み → 表示サイズへの縮小 → ノイズ付与 の3段

use crate::core::{Transform, WorkItem};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use std::path::PathBuf;

/// パイプラインを流れる画像ペイロード
///
/// 読み込みステージを通過するまで `image` は空のまま。
#[derive(Debug)]
pub struct ImagePayload {
    pub path: PathBuf,
    pub image: Option<DynamicImage>,
}

impl ImagePayload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            image: None,
        }
    }

    fn image_mut(&mut self) -> Result<&mut DynamicImage> {
        self.image
            .as_mut()
            .context("画像が未読み込みです(読み込みステージより前に配置されていませんか)")
    }
}

/// ファイルから画像を読み込むステージ
#[derive(Debug, Default, Clone)]
pub struct LoadImageTransform;

impl LoadImageTransform {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transform<ImagePayload> for LoadImageTransform {
    async fn apply(&self, item: &mut WorkItem<ImagePayload>) -> Result<()> {
        let bytes = tokio::fs::read(&item.payload.path)
            .await
            .with_context(|| format!("読み込み失敗: {}", item.payload.path.display()))?;

        // デコードはCPU負荷が高いのでブロッキングプールへ逃がす
        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .context("画像デコードタスクの起動に失敗しました")?
            .with_context(|| format!("デコード失敗: {}", item.payload.path.display()))?;

        item.payload.image = Some(image);
        Ok(())
    }
}

/// アスペクト比を保って表示サイズへ縮小するステージ
#[derive(Debug, Clone)]
pub struct ScaleImageTransform {
    max_width: u32,
    max_height: u32,
}

impl ScaleImageTransform {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
        }
    }
}

#[async_trait]
impl Transform<ImagePayload> for ScaleImageTransform {
    async fn apply(&self, item: &mut WorkItem<ImagePayload>) -> Result<()> {
        let image = item.payload.image_mut()?;

        if image.width() > self.max_width || image.height() > self.max_height {
            *image = image.resize(
                self.max_width,
                self.max_height,
                image::imageops::FilterType::Triangle,
            );
        }
        Ok(())
    }
}

/// 画素に擬似乱数ノイズを加えるステージ
///
/// シーケンス番号から決定的に生成するため同じ入力は同じ出力になる。
#[derive(Debug, Clone)]
pub struct NoiseImageTransform {
    amount: f64,
}

impl NoiseImageTransform {
    /// `amount` は 0.0(無変化)〜1.0(最大±128)のノイズ量
    pub fn new(amount: f64) -> Self {
        Self {
            amount: amount.clamp(0.0, 1.0),
        }
    }

    fn next_random(state: &mut u64) -> u64 {
        // xorshift64
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        x
    }
}

#[async_trait]
impl Transform<ImagePayload> for NoiseImageTransform {
    async fn apply(&self, item: &mut WorkItem<ImagePayload>) -> Result<()> {
        if self.amount == 0.0 {
            return Ok(());
        }

        let sequence = item.sequence();
        let image = item.payload.image_mut()?;
        let amount = self.amount;

        let source = std::mem::replace(image, DynamicImage::new_rgb8(1, 1));
        let noisy = tokio::task::spawn_blocking(move || {
            let mut rgba = source.into_rgba8();
            let mut state = sequence.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
            let span = (amount * 128.0) as i32;

            for pixel in rgba.pixels_mut() {
                let noise = (Self::next_random(&mut state) % (2 * span as u64 + 1)) as i32 - span;
                for channel in 0..3 {
                    let value = pixel.0[channel] as i32 + noise;
                    pixel.0[channel] = value.clamp(0, 255) as u8;
                }
            }
            DynamicImage::ImageRgba8(rgba)
        })
        .await
        .context("ノイズ付与タスクの起動に失敗しました")?;

        *image = noisy;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FIRST_SEQUENCE;
    use image::GenericImageView;

    fn item_with_image(width: u32, height: u32) -> WorkItem<ImagePayload> {
        let mut item = WorkItem::new(FIRST_SEQUENCE, "test.png", ImagePayload::new("test.png"));
        item.payload.image = Some(DynamicImage::new_rgb8(width, height));
        item
    }

    #[tokio::test]
    async fn test_scale_shrinks_oversized_image() {
        let transform = ScaleImageTransform::new(100, 100);
        let mut item = item_with_image(400, 200);

        transform.apply(&mut item).await.unwrap();

        let image = item.payload.image.as_ref().unwrap();
        // アスペクト比を保って上限内に収まる
        assert!(image.width() <= 100 && image.height() <= 100);
        assert_eq!(image.dimensions(), (100, 50));
    }

    #[tokio::test]
    async fn test_scale_keeps_small_image_untouched() {
        let transform = ScaleImageTransform::new(100, 100);
        let mut item = item_with_image(40, 30);

        transform.apply(&mut item).await.unwrap();

        assert_eq!(item.payload.image.as_ref().unwrap().dimensions(), (40, 30));
    }

    #[tokio::test]
    async fn test_scale_requires_loaded_image() {
        let transform = ScaleImageTransform::new(100, 100);
        let mut item = WorkItem::new(1, "x.png", ImagePayload::new("x.png"));

        let result = transform.apply(&mut item).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_noise_is_deterministic_per_sequence() {
        let transform = NoiseImageTransform::new(0.5);

        let mut first = item_with_image(8, 8);
        let mut second = item_with_image(8, 8);
        transform.apply(&mut first).await.unwrap();
        transform.apply(&mut second).await.unwrap();

        // 同じシーケンス番号・同じ入力なら結果も一致する
        assert_eq!(
            first.payload.image.as_ref().unwrap().to_rgba8().as_raw(),
            second.payload.image.as_ref().unwrap().to_rgba8().as_raw()
        );
    }

    #[tokio::test]
    async fn test_noise_zero_amount_is_identity() {
        let transform = NoiseImageTransform::new(0.0);
        let mut item = item_with_image(4, 4);
        let before = item.payload.image.as_ref().unwrap().to_rgba8();

        transform.apply(&mut item).await.unwrap();

        assert_eq!(
            item.payload.image.as_ref().unwrap().to_rgba8().as_raw(),
            before.as_raw()
        );
    }

    #[tokio::test]
    async fn test_load_rejects_missing_file() {
        let transform = LoadImageTransform::new();
        let mut item = WorkItem::new(
            1,
            "missing.png",
            ImagePayload::new("/nonexistent/missing.png"),
        );

        let result = transform.apply(&mut item).await;
        assert!(result.is_err());
    }
}
