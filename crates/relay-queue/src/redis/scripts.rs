//! Lua scripts for atomic queue transitions.
//!
//! Every state change of a job touches several keys (lists, sorted sets,
//! the job hash, its lock), so each transition runs as one script.

use std::fmt;

use redis::Script;

/// Add a job unless its id already exists.
///
/// KEYS: wait, id counter.
/// ARGV: job prefix, requested id (empty to generate), data, opts, now ms.
/// Returns the id, or nil for a duplicate.
const ENQUEUE: &str = r#"
local id = ARGV[2]
if id == '' then
  id = tostring(redis.call('INCR', KEYS[2]))
end
local jobKey = ARGV[1] .. id
if redis.call('EXISTS', jobKey) == 1 then
  return false
end
redis.call('HSET', jobKey, 'data', ARGV[3], 'opts', ARGV[4], 'attemptsMade', 0, 'timestamp', ARGV[5])
redis.call('LPUSH', KEYS[1], id)
return id
"#;

/// Promote due delayed jobs, then move the oldest waiting id to active and
/// lock it.
///
/// KEYS: wait, active, delayed.
/// ARGV: now ms, job prefix, lock duration ms, lock token.
/// Returns {id, data, opts, attemptsMade} or nil.
const FETCH: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, jobId in ipairs(due) do
  redis.call('ZREM', KEYS[3], jobId)
  redis.call('LPUSH', KEYS[1], jobId)
end
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not id then
  return false
end
local jobKey = ARGV[2] .. id
redis.call('SET', jobKey .. ':lock', ARGV[4], 'PX', ARGV[3])
redis.call('HSET', jobKey, 'processedOn', ARGV[1])
local fields = redis.call('HMGET', jobKey, 'data', 'opts', 'attemptsMade')
return {id, fields[1] or '', fields[2] or '', fields[3] or '0'}
"#;

/// Move an active job to a retention set and trim that set.
///
/// KEYS: active, target set.
/// ARGV: id, job prefix, now ms, lock token, keep count, max age ms
/// (0 for none), failed reason (empty for none), attemptsMade.
/// Returns the number of trimmed entries, or -1 when another worker holds
/// the lock.
const FINISH: &str = r#"
local jobKey = ARGV[2] .. ARGV[1]
local lockKey = jobKey .. ':lock'
local owner = redis.call('GET', lockKey)
if owner and owner ~= ARGV[4] then
  return -1
end
redis.call('DEL', lockKey)
redis.call('LREM', KEYS[1], -1, ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
redis.call('HSET', jobKey, 'finishedOn', ARGV[3], 'attemptsMade', ARGV[8])
if ARGV[7] ~= '' then
  redis.call('HSET', jobKey, 'failedReason', ARGV[7])
end
local removed = 0
local maxAge = tonumber(ARGV[6])
if maxAge > 0 then
  local cutoff = tonumber(ARGV[3]) - maxAge
  local old = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', '(' .. cutoff)
  for _, oldId in ipairs(old) do
    redis.call('DEL', ARGV[2] .. oldId)
  end
  removed = removed + redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', '(' .. cutoff)
end
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[5])
if excess > 0 then
  local stale = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
  for _, oldId in ipairs(stale) do
    redis.call('DEL', ARGV[2] .. oldId)
  end
  removed = removed + redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
end
return removed
"#;

/// Release an active job for another attempt, delayed when a backoff
/// applies.
///
/// KEYS: active, delayed, wait.
/// ARGV: id, job prefix, now ms, lock token, delay ms, failed reason,
/// attemptsMade.
/// Returns 1, or -1 when another worker holds the lock.
const RETRY: &str = r#"
local jobKey = ARGV[2] .. ARGV[1]
local lockKey = jobKey .. ':lock'
local owner = redis.call('GET', lockKey)
if owner and owner ~= ARGV[4] then
  return -1
end
redis.call('DEL', lockKey)
redis.call('LREM', KEYS[1], -1, ARGV[1])
redis.call('HSET', jobKey, 'attemptsMade', ARGV[7], 'failedReason', ARGV[6])
local delay = tonumber(ARGV[5])
if delay > 0 then
  redis.call('ZADD', KEYS[2], tonumber(ARGV[3]) + delay, ARGV[1])
else
  redis.call('LPUSH', KEYS[3], ARGV[1])
end
return 1
"#;

/// Return active jobs whose lock expired to the head of the wait list.
///
/// KEYS: active, wait.
/// ARGV: job prefix.
/// Returns the recovered ids.
const RECOVER_STALLED: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
local recovered = {}
for _, id in ipairs(ids) do
  if redis.call('EXISTS', ARGV[1] .. id .. ':lock') == 0 then
    redis.call('LREM', KEYS[1], 1, id)
    redis.call('RPUSH', KEYS[2], id)
    table.insert(recovered, id)
  end
end
return recovered
"#;

/// Loaded transition scripts. Each is sent by SHA and reloaded on
/// `NOSCRIPT`.
pub struct QueueScripts {
    /// See [`ENQUEUE`].
    pub enqueue: Script,
    /// See [`FETCH`].
    pub fetch: Script,
    /// See [`FINISH`].
    pub finish: Script,
    /// See [`RETRY`].
    pub retry: Script,
    /// See [`RECOVER_STALLED`].
    pub recover_stalled: Script,
}

impl QueueScripts {
    /// Compile the scripts (hashing only; nothing is sent yet).
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            fetch: Script::new(FETCH),
            finish: Script::new(FINISH),
            retry: Script::new(RETRY),
            recover_stalled: Script::new(RECOVER_STALLED),
        }
    }
}

impl Default for QueueScripts {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueueScripts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueScripts")
            .field("enqueue", &self.enqueue.get_hash())
            .field("fetch", &self.fetch.get_hash())
            .field("finish", &self.finish.get_hash())
            .field("retry", &self.retry.get_hash())
            .field("recover_stalled", &self.recover_stalled.get_hash())
            .finish()
    }
}
