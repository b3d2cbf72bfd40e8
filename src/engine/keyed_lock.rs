// ==========================================
// 毛绒玩具生产编排核心 - 按键互斥锁
// ==========================================
// 职责: 对同一物料/产线/工单的“先检查再修改”提供互斥边界
// 键: material:{id} / line:{DEPT} / task:{id}
// 约定: 一次操作需要的全部键通过 lock_many 一次性按序获取，避免死锁
// 回收: 最后一个持有者释放时移除槽位，键表只保留正在使用的键
// ==========================================

use crate::domain::types::Department;
use dashmap::DashMap;
use std::sync::{Arc, Condvar, Mutex};

pub fn material_key(material_id: &str) -> String {
    format!("material:{}", material_id)
}

pub fn line_key(department: Department) -> String {
    format!("line:{}", department.to_db_str())
}

pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

#[derive(Default)]
struct KeySlot {
    held: Mutex<bool>,
    released: Condvar,
}

// ==========================================
// KeyedLock - 键级互斥表
// ==========================================
#[derive(Default)]
pub struct KeyedLock {
    slots: Arc<DashMap<String, Arc<KeySlot>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取单个键（阻塞直到可用）
    pub fn lock(&self, key: &str) -> KeyedGuard {
        // DashMap 的分片引用必须在等待前释放
        let slot = self
            .slots
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();

        {
            let mut held = slot.held.lock().unwrap_or_else(|e| e.into_inner());
            while *held {
                held = slot
                    .released
                    .wait(held)
                    .unwrap_or_else(|e| e.into_inner());
            }
            *held = true;
        }

        tracing::trace!(key, "获取键锁");
        KeyedGuard {
            key: key.to_string(),
            slot,
            slots: Arc::clone(&self.slots),
        }
    }

    /// 按字典序获取多个键（自动去重）
    pub fn lock_many<I, S>(&self, keys: I) -> Vec<KeyedGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();
        keys.iter().map(|k| self.lock(k)).collect()
    }

    /// 当前仍在使用（持有或等待）的键数量
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }
}

/// RAII 键锁守卫
pub struct KeyedGuard {
    key: String,
    slot: Arc<KeySlot>,
    slots: Arc<DashMap<String, Arc<KeySlot>>>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut held = self.slot.held.lock().unwrap_or_else(|e| e.into_inner());
        *held = false;
        self.slot.released.notify_one();
        drop(held);

        // 引用只剩键表与本守卫时无人等待；分片写锁内判断，与 lock 的 clone 互斥
        let slot = &self.slot;
        self.slots
            .remove_if(&self.key, |_, v| Arc::ptr_eq(v, slot) && Arc::strong_count(v) == 2);
        tracing::trace!(key = %self.key, "释放键锁");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    let _g = locks.lock("material:PLUSH");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = KeyedLock::new();
        let a = locks.lock(&line_key(Department::Sewing));
        let b = locks.lock(&line_key(Department::Packing));
        assert_eq!(locks.key_count(), 2);
        drop(a);
        assert_eq!(locks.key_count(), 1);
        drop(b);
        assert_eq!(locks.key_count(), 0);
    }

    #[test]
    fn test_released_keys_are_evicted() {
        let locks = KeyedLock::new();
        for i in 0..10_000 {
            let _g = locks.lock(&task_key(&format!("T{}", i)));
        }
        assert_eq!(locks.key_count(), 0);

        let guards = locks.lock_many((0..50).map(|i| material_key(&format!("M{}", i))));
        assert_eq!(locks.key_count(), 50);
        drop(guards);
        assert_eq!(locks.key_count(), 0);
    }

    #[test]
    fn test_contended_key_evicted_after_last_holder() {
        let locks = Arc::new(KeyedLock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _g = locks.lock("line:SEWING");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(locks.key_count(), 0);
    }

    #[test]
    fn test_lock_many_dedups_and_sorts() {
        let locks = KeyedLock::new();
        let guards = locks.lock_many(vec![
            task_key("T2"),
            material_key("FIBER"),
            task_key("T2"),
            line_key(Department::Cutting),
        ]);
        let keys: Vec<&str> = guards.iter().map(|g| g.key()).collect();
        assert_eq!(keys, vec!["line:CUTTING", "material:FIBER", "task:T2"]);
    }
}
