// 画像処理層 - パイプラインに載せるデモ用の具象コラボレータ
// 読み込み・縮小・ノイズ付与の各変換と、ディレクトリソース・表示シンク

pub mod sink;
pub mod source;
pub mod transforms;

pub use sink::ConsoleDisplaySink;
pub use source::DirectoryImageSource;
pub use transforms::{ImagePayload, LoadImageTransform, NoiseImageTransform, ScaleImageTransform};
