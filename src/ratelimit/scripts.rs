//! Lua script for the atomic token-bucket step.

/// Atomic read/refill/consume on one bucket.
///
/// KEYS\[1\] = bucket hash with fields `tokens` and `ts` (ms epoch)
/// ARGV\[1\] = burst capacity
/// ARGV\[2\] = refill rate in tokens per second
/// ARGV\[3\] = cost of this request
/// ARGV\[4\] = caller clock in ms epoch
///
/// Returns a three-element array: `{allowed, tokens_after, retry_after_ms}`
/// where `tokens_after` is a string to preserve the fraction. The bucket
/// expires once it would be fully refilled anyway, so idle keys vanish.
pub const TOKEN_BUCKET: &str = r"
local burst = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local data = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(data[1])
local ts = tonumber(data[2])
if tokens == nil or ts == nil then
    tokens = burst
    ts = now
end

local elapsed = (now - ts) / 1000.0
if elapsed < 0 then
    elapsed = 0
end
local refill = elapsed * rate
if refill > burst - tokens then
    refill = burst - tokens
end
if refill < 0 then
    refill = 0
end
tokens = tokens + refill

local allowed = 0
local retry_ms = 0
if tokens >= cost then
    tokens = tokens - cost
    allowed = 1
elseif rate > 0 then
    retry_ms = math.ceil((cost - tokens) * 1000.0 / rate)
else
    retry_ms = 3600000
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now)
if rate > 0 then
    redis.call('PEXPIRE', KEYS[1], math.ceil(burst * 1000.0 / rate) + 60000)
else
    redis.call('PEXPIRE', KEYS[1], 3600000)
end

return {allowed, tostring(tokens), retry_ms}
";
