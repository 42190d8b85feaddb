// ディレクトリ画像ソース
// 対象ディレクトリを走査し、ファイル一覧を繰り返し供給する

use super::transforms::ImagePayload;
use crate::core::ItemSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 画像として扱う拡張子
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// ディレクトリ内の画像を(必要なら無限に)供給するソース
///
/// ファイル一覧は構築時に確定し、一貫した順序で処理するためソートする。
/// `cycle` が真なら一覧を使い切るたびに先頭へ巻き戻す。
pub struct DirectoryImageSource {
    files: Vec<PathBuf>,
    next: usize,
    cycle: bool,
    remaining: Option<u64>,
}

impl DirectoryImageSource {
    pub fn scan(directory: &Path, cycle: bool, limit: Option<u64>) -> Result<Self> {
        let mut files = Vec::new();
        for entry in WalkDir::new(directory) {
            let entry = entry
                .with_context(|| format!("ディレクトリ走査エラー: {}", directory.display()))?;
            if entry.file_type().is_file() && is_image_file(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();

        if files.is_empty() {
            anyhow::bail!("画像ファイルが見つかりません: {}", directory.display());
        }

        Ok(Self {
            files,
            next: 0,
            cycle,
            remaining: limit,
        })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[async_trait]
impl ItemSource<ImagePayload> for DirectoryImageSource {
    async fn next_item(&mut self) -> Result<Option<(String, ImagePayload)>> {
        if self.next >= self.files.len() && !self.cycle {
            return Ok(None);
        }
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }

        let path = self.files[self.next % self.files.len()].clone();
        self.next = if self.cycle {
            (self.next + 1) % self.files.len()
        } else {
            self.next + 1
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Some((name, ImagePayload::new(path))))
    }
}
