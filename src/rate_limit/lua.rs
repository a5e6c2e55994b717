/// Lua script for the atomic token-bucket check in Redis.
///
/// The whole refill-and-consume decision runs server-side in one round
/// trip, serialized per key by Redis itself. The script reads the store's
/// own clock (`TIME`) so that every stateless replica charges buckets
/// against the same timeline; caller clocks never enter the math.
///
/// KEYS[1] = the bucket key
/// ARGV[1] = capacity (maximum tokens)
/// ARGV[2] = refill rate (tokens per second)
/// ARGV[3] = cost (tokens consumed per request)
///
/// Returns: [allowed (0/1), remaining tokens (floored), reset epoch seconds]
///
/// On denial only `last_refill` is written back, never the refilled token
/// count: a client hammering through a long denial streak must not bank
/// refill credit it would burst with later.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])

local time = redis.call('TIME')
local now = tonumber(time[1])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_rate)

if tokens >= cost then
    tokens = tokens - cost
    redis.call('HMSET', key, 'tokens', tokens, 'last_refill', now)
    local ttl = 3600
    if tokens > capacity / 2 then
        ttl = 7200
    end
    redis.call('EXPIRE', key, ttl)
    return {1, math.floor(tokens), now}
else
    redis.call('HSET', key, 'last_refill', now)
    redis.call('EXPIRE', key, 3600)
    local wait = math.ceil((cost - tokens) / refill_rate)
    return {0, math.floor(tokens), now + wait}
end
"#;
