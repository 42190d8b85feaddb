// 汎用アイテムソース実装
// 有限リスト供給と、リストを無限に繰り返す循環供給

use crate::core::ItemSource;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;

/// メモリ上のリストを1巡だけ供給するソース
pub struct InMemorySource<T> {
    items: VecDeque<(String, T)>,
}

impl<T> InMemorySource<T> {
    pub fn new(items: Vec<(String, T)>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// 表示名を自動採番してペイロードだけから作成
    pub fn from_payloads(payloads: Vec<T>) -> Self {
        let items = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| (format!("item-{}", index + 1), payload))
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl<T: Send + 'static> ItemSource<T> for InMemorySource<T> {
    async fn next_item(&mut self) -> Result<Option<(String, T)>> {
        Ok(self.items.pop_front())
    }
}

/// リストを先頭へ巻き戻しながら繰り返し供給するソース
///
/// 上限を指定しない場合は尽きることがなく、キャンセルだけが
/// 実行を止める。
pub struct CyclingSource<T: Clone> {
    items: Vec<(String, T)>,
    next: usize,
    remaining: Option<u64>,
}

impl<T: Clone> CyclingSource<T> {
    pub fn new(items: Vec<(String, T)>, limit: Option<u64>) -> Self {
        Self {
            items,
            next: 0,
            remaining: limit,
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ItemSource<T> for CyclingSource<T> {
    async fn next_item(&mut self) -> Result<Option<(String, T)>> {
        if self.items.is_empty() {
            return Ok(None);
        }
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }

        let (name, payload) = &self.items[self.next];
        self.next = (self.next + 1) % self.items.len();
        Ok(Some((name.clone(), payload.clone())))
    }
}
