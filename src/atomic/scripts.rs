// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-side scripts and the EVALSHA-then-EVAL invocation protocol.
//!
//! Every script that receives a variable number of values hands them to
//! `unpack()` in slices of at most `step` (the configured C stack limit).

use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, FromRedisValue, ToRedisArgs};
use tracing::debug;

use crate::error::CacheResult;
use crate::metrics;

/// KEYS: entry, global tags, global ids
///
/// ARGV: tag prefix, id, data, encoded tags, mtime, ttl (0 = infinite),
/// track ids, step, expected-present, expected raw tags, new tag count,
/// new tags..., removed tags...
///
/// Returns 0 without writing when the stored tag field no longer matches
/// the expected value.
pub(crate) const SAVE: &str = r#"
local current = redis.call('HGET', KEYS[1], 't')
if ARGV[9] == '1' then
  if current ~= ARGV[10] then return 0 end
elseif current then
  return 0
end
local infinite = 0
if ARGV[6] == '0' then infinite = 1 end
redis.call('HSET', KEYS[1], 'd', ARGV[3], 't', ARGV[4], 'm', ARGV[5], 'i', infinite)
if infinite == 1 then
  redis.call('PERSIST', KEYS[1])
else
  redis.call('EXPIRE', KEYS[1], ARGV[6])
end
local step = tonumber(ARGV[8])
local first = 12
local last = first + tonumber(ARGV[11]) - 1
for i = first, last, step do
  redis.call('SADD', KEYS[2], unpack(ARGV, i, math.min(i + step - 1, last)))
end
for i = first, last do
  redis.call('SADD', ARGV[1] .. ARGV[i], ARGV[2])
end
for i = last + 1, #ARGV do
  local tagkey = ARGV[1] .. ARGV[i]
  redis.call('SREM', tagkey, ARGV[2])
  if redis.call('SCARD', tagkey) == 0 then
    redis.call('SREM', KEYS[2], ARGV[i])
  end
end
if ARGV[7] == '1' then
  redis.call('SADD', KEYS[3], ARGV[2])
end
return 1
"#;

/// KEYS: entry, global tags, global ids
///
/// ARGV: tag prefix, id, track ids, expected-present, expected raw tags,
/// tags...
///
/// Returns -1 on a tag field mismatch, otherwise the number of deleted
/// entries (0 or 1).
pub(crate) const REMOVE: &str = r#"
local current = redis.call('HGET', KEYS[1], 't')
if ARGV[4] == '1' then
  if current ~= ARGV[5] then return -1 end
elseif current then
  return -1
end
local existed = redis.call('DEL', KEYS[1])
for i = 6, #ARGV do
  local tagkey = ARGV[1] .. ARGV[i]
  redis.call('SREM', tagkey, ARGV[2])
  if redis.call('SCARD', tagkey) == 0 then
    redis.call('SREM', KEYS[2], ARGV[i])
  end
end
if ARGV[3] == '1' then
  redis.call('SREM', KEYS[3], ARGV[2])
end
return existed
"#;

/// KEYS: global tags, global ids
///
/// ARGV: entry prefix, tag prefix, track ids, step, known live count N,
/// N known live ids, tags...
///
/// Removes ids whose entry no longer exists from each tag set; drops tag
/// sets with no live member. Ids passed as known live are not looked up.
/// Returns `{ids swept, tags dropped, lookups, {ids found live}}`.
pub(crate) const COLLECT_GARBAGE: &str = r#"
local step = tonumber(ARGV[4])
local known = tonumber(ARGV[5])
local alive = {}
for k = 6, 5 + known do
  alive[ARGV[k]] = true
end
local found = {}
local swept, dropped, checks = 0, 0, 0
for t = 6 + known, #ARGV do
  local tagkey = ARGV[2] .. ARGV[t]
  local members = redis.call('SMEMBERS', tagkey)
  local expired = {}
  local live = 0
  for _, id in ipairs(members) do
    local exists = alive[id]
    if exists == nil then
      exists = redis.call('EXISTS', ARGV[1] .. id) == 1
      alive[id] = exists
      checks = checks + 1
      if exists then
        found[#found + 1] = id
      end
    end
    if exists then
      live = live + 1
    else
      expired[#expired + 1] = id
    end
  end
  if live == 0 then
    redis.call('UNLINK', tagkey)
    redis.call('SREM', KEYS[1], ARGV[t])
    dropped = dropped + 1
  else
    for i = 1, #expired, step do
      redis.call('SREM', tagkey, unpack(expired, i, math.min(i + step - 1, #expired)))
    end
  end
  if ARGV[3] == '1' then
    for i = 1, #expired, step do
      redis.call('SREM', KEYS[2], unpack(expired, i, math.min(i + step - 1, #expired)))
    end
  end
  swept = swept + #expired
end
return {swept, dropped, checks, found}
"#;

/// Script body plus its SHA1, computed once.
#[derive(Debug, Clone)]
pub(crate) struct LuaScript {
    name: &'static str,
    body: &'static str,
    hash: String,
}

impl LuaScript {
    pub fn new(name: &'static str, body: &'static str) -> Self {
        Self {
            name,
            body,
            hash: redis::Script::new(body).get_hash().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Run by hash; on `NOSCRIPT` send the body once, which also caches it.
    pub async fn invoke<T: FromRedisValue>(
        &self,
        conn: &mut MultiplexedConnection,
        call: &ScriptCall,
    ) -> CacheResult<T> {
        let result = redis::cmd("EVALSHA")
            .arg(&self.hash)
            .arg(call.keys.len())
            .arg(&call.keys)
            .arg(&call.args)
            .query_async::<T>(conn)
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                debug!(script = self.name, "Script not cached on server, sending body");
                metrics::record_script_reload(self.name);
                Ok(redis::cmd("EVAL")
                    .arg(self.body)
                    .arg(call.keys.len())
                    .arg(&call.keys)
                    .arg(&call.args)
                    .query_async::<T>(conn)
                    .await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// KEYS and ARGV for one invocation.
#[derive(Debug, Default)]
pub(crate) struct ScriptCall {
    keys: Vec<String>,
    args: Vec<Vec<u8>>,
}

impl ScriptCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&mut self, key: impl Into<String>) -> &mut Self {
        self.keys.push(key.into());
        self
    }

    /// Appends every value `arg` expands to (a slice of strings becomes
    /// several arguments, a byte slice stays one).
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Self {
        self.args.extend(arg.to_redis_args());
        self
    }

    pub fn flag(&mut self, on: bool) -> &mut Self {
        self.arg(if on { "1" } else { "0" })
    }

    #[cfg(test)]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}
