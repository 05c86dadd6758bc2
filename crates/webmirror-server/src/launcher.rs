//! Inline launcher page: paste a URL, resolve it, jump to the mirror.

pub const LAUNCHER_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<meta name="robots" content="noindex,nofollow">
<title>webmirror</title>
<style>
body{background:#111;color:#ddd;font-family:system-ui,sans-serif;display:flex;min-height:100vh;align-items:center;justify-content:center;margin:0}
main{max-width:480px;width:100%;padding:2rem}
h1{font-size:1.2rem;font-weight:600}
form{display:flex;gap:.5rem;margin-top:1rem}
input{flex:1;padding:.5rem .75rem;border:1px solid #333;border-radius:6px;background:#1a1a1a;color:#ddd}
button{padding:.5rem 1rem;border:0;border-radius:6px;background:#2563eb;color:#fff;cursor:pointer}
p.err{color:#f87171;min-height:1.2em;font-size:.9rem}
</style>
</head>
<body>
<main>
<h1>webmirror</h1>
<form id="f">
<input id="u" type="url" placeholder="https://example.com/page" required autofocus>
<button type="submit">Mirror</button>
</form>
<p class="err" id="e"></p>
<script>
document.getElementById('f').addEventListener('submit', async (ev) => {
  ev.preventDefault();
  const err = document.getElementById('e');
  err.textContent = '';
  try {
    const res = await fetch('/api/resolve', {
      method: 'POST',
      headers: {'content-type': 'application/json'},
      body: JSON.stringify({url: document.getElementById('u').value}),
    });
    const data = await res.json();
    if (data.ok) {
      location.href = data.launchUrl;
    } else {
      err.textContent = data.error || 'resolve failed';
    }
  } catch (e) {
    err.textContent = 'request failed';
  }
});
</script>
</main>
</body>
</html>
"#;
