//! 页缓存
//!
//! 以 (文件, 页对齐偏移) 为键索引共享文件页。查找未命中与插入在同一个
//! 临界区内完成，保证同一键只有一个创建者。
//!
//! 共享页的引用计数变化与索引项的删除都在缓存锁下进行；最后一个引用
//! 消失后，帧在缓存锁之外释放。

use core::sync::atomic::Ordering;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use sync::SpinLock;

use super::{PageFlags, VmPage};
use crate::file::FileId;

/// 页缓存键
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    /// 文件标识
    pub file: FileId,
    /// 页对齐的文件内偏移
    pub offset: usize,
}

/// 共享文件页索引
pub struct PageCache {
    entries: SpinLock<BTreeMap<CacheKey, Arc<VmPage>>>,
}

impl PageCache {
    /// 创建空缓存
    pub fn new() -> Self {
        PageCache {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// 查找已存在的共享页并取得一个引用
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<VmPage>> {
        let entries = self.entries.lock();
        let page = entries.get(key)?;
        page.refs().fetch_add(1, Ordering::AcqRel);
        Some(page.clone())
    }

    /// 查找共享页，不存在时插入一个 `PENDING` 的新页
    ///
    /// 返回的页已被取得一个引用；第二个返回值为 `true` 时调用者是创建者，
    /// 必须填充页面后清除 `PENDING`，或者调用 [`PageCache::abandon`]。
    pub fn lookup_or_create(&self, key: CacheKey) -> (Arc<VmPage>, bool) {
        let mut entries = self.entries.lock();
        if let Some(page) = entries.get(&key) {
            page.refs().fetch_add(1, Ordering::AcqRel);
            return (page.clone(), false);
        }
        let page = VmPage::new_pending(key);
        entries.insert(key, page.clone());
        log::debug!("vm: page cache created {}+{:#x}", key.file.0, key.offset);
        (page, true)
    }

    /// 为一个仍被映射的共享页增加引用
    ///
    /// 引用计数已经归零的页面不能复活，此时返回 `false`。
    pub fn get_ref(&self, page: &Arc<VmPage>) -> bool {
        let _entries = self.entries.lock();
        let refs = page.refs();
        if refs.load(Ordering::Acquire) == 0 {
            return false;
        }
        refs.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// 减少一个引用，返回是否为最后一个引用
    ///
    /// 最后一个引用消失时从索引中移除该页；帧由调用者在缓存锁之外释放。
    pub fn put_ref(&self, page: &Arc<VmPage>) -> bool {
        let mut entries = self.entries.lock();
        let prev = page.refs().fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "vm: shared page refcount underflow");
        if prev != 1 {
            return false;
        }
        if let Some(key) = page.key() {
            if entries.get(&key).is_some_and(|p| Arc::ptr_eq(p, page)) {
                entries.remove(&key);
            }
        }
        true
    }

    /// 减少一个引用，最后一个引用消失时释放帧
    ///
    /// 调用者不能持有该页的页锁。
    pub fn release(&self, page: &Arc<VmPage>) {
        if self.put_ref(page) {
            if let Some(key) = page.key() {
                log::debug!("vm: page cache released {}+{:#x}", key.file.0, key.offset);
            }
            drop(page.take_frame());
        }
    }

    /// 创建者填充失败：标记 `FAILED`，移除索引项并放弃自己的引用
    ///
    /// 正在等待的页面会看到 `FAILED`，放弃引用后重新查找。
    pub fn abandon(&self, page: &Arc<VmPage>) {
        page.lock().flags.insert(PageFlags::FAILED);
        {
            let mut entries = self.entries.lock();
            if let Some(key) = page.key() {
                if entries.get(&key).is_some_and(|p| Arc::ptr_eq(p, page)) {
                    entries.remove(&key);
                }
            }
        }
        self.release(page);
    }

    /// 索引中的页面数量
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 索引是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 是否缓存了某个键
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_test_env;

    fn key(offset: usize) -> CacheKey {
        CacheKey {
            file: FileId(9),
            offset,
        }
    }

    #[test]
    fn test_lookup_or_create_single_creator() {
        init_test_env();
        let cache = PageCache::new();
        let (first, created) = cache.lookup_or_create(key(0));
        assert!(created);
        assert!(first.flags().contains(PageFlags::PENDING));

        let (second, created) = cache.lookup_or_create(key(0));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
    }

    #[test]
    fn test_last_put_ref_removes_entry() {
        init_test_env();
        let cache = PageCache::new();
        let (page, _) = cache.lookup_or_create(key(4096));
        assert!(cache.get_ref(&page));
        assert!(!cache.put_ref(&page));
        assert!(cache.contains(&key(4096)));
        assert!(cache.put_ref(&page));
        assert!(cache.is_empty());
        assert!(!cache.get_ref(&page));
    }

    #[test]
    fn test_abandon_marks_failed_for_waiters() {
        init_test_env();
        let cache = PageCache::new();
        let (page, _) = cache.lookup_or_create(key(0));
        let waiter = cache.lookup(&key(0)).unwrap();
        cache.abandon(&page);
        assert!(cache.lookup(&key(0)).is_none());
        assert!(matches!(waiter.wait_ready(), super::super::WaitResult::Failed));
        cache.release(&waiter);
        assert_eq!(waiter.ref_count(), 0);
    }
}
