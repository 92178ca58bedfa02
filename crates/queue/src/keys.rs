use bulwark_domain::TaskPriority;

/// 到期重试集合，分数为到期时间（毫秒）
pub const RETRY_SET: &str = "queue:retry";

pub fn task(id: &str) -> String {
    format!("task:{id}")
}

pub fn queue(priority: TaskPriority) -> String {
    format!("queue:{}", priority.as_str())
}

pub fn dlq(priority: TaskPriority) -> String {
    format!("dlq:{}", priority.as_str())
}

pub fn dlq_entry(id: &str) -> String {
    format!("dlq:entry:{id}")
}

pub fn idempotency(key: &str) -> String {
    format!("idem:{key}")
}
