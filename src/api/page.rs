//! Browser control page served at `/`.

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>camwatch</title>
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<style>
  body { font-family: sans-serif; margin: 0; background: #f5f5f5; }
  .container { max-width: 840px; margin: 0 auto; padding: 20px; background: #fff; }
  h1 { text-align: center; color: #333; margin-bottom: 4px; }
  .subtitle { text-align: center; color: #666; font-size: 14px; }
  .controls { display: flex; justify-content: center; flex-wrap: wrap; margin: 20px 0; }
  button { padding: 12px 24px; margin: 5px; border: none; border-radius: 5px;
           font-size: 16px; font-weight: bold; color: #fff; cursor: pointer; }
  button:disabled { opacity: 0.5; cursor: not-allowed; }
  .start { background: #4caf50; }
  .stop { background: #f44336; }
  .toggle { background: #2196f3; }
  .status { text-align: center; padding: 10px; border-radius: 5px; font-weight: bold; }
  .status.running { background: #e8f5e9; color: #4caf50; }
  .status.stopped { background: #ffebee; color: #f44336; }
  .video { margin: 20px auto; border: 1px solid #ddd; border-radius: 5px; min-height: 60px; }
  .video img { width: 100%; display: block; }
  #placeholder { padding: 20px; text-align: center; color: #999; }
</style>
</head>
<body>
<div class="container">
  <h1>Live Camera</h1>
  <div class="subtitle">Open on any device on this network: <strong class="address">http://{{ADDRESS}}</strong></div>
  <div class="controls">
    <button class="start" id="startBtn" onclick="startCamera()">Start Camera</button>
    <button class="stop" id="stopBtn" onclick="stopCamera()" disabled>Stop Camera</button>
    <button class="toggle" id="toggleBtn" onclick="toggleDetection()" disabled>Toggle Detection</button>
  </div>
  <div class="status stopped" id="statusBox">Camera is stopped.</div>
  <div class="video">
    <img id="video" alt="live video" style="display: none;">
    <div id="placeholder">Video appears here once the camera is started.</div>
  </div>
</div>
<script>
  let running = false;
  let detection = false;

  function reloadVideo() {
    document.getElementById('video').src = '/video_feed?' + Date.now();
  }

  function render() {
    document.getElementById('startBtn').disabled = running;
    document.getElementById('stopBtn').disabled = !running;
    document.getElementById('toggleBtn').disabled = !running;
    const box = document.getElementById('statusBox');
    const video = document.getElementById('video');
    if (running) {
      box.textContent = 'Camera is running. Detection is ' + (detection ? 'ON' : 'OFF') + '.';
      box.className = 'status running';
      video.style.display = 'block';
      document.getElementById('placeholder').style.display = 'none';
    } else {
      box.textContent = 'Camera is stopped.';
      box.className = 'status stopped';
      video.style.display = 'none';
      video.removeAttribute('src');
      document.getElementById('placeholder').style.display = 'block';
    }
  }

  function post(path, body) {
    const init = { method: 'POST' };
    if (body !== undefined) {
      init.headers = { 'Content-Type': 'application/json' };
      init.body = JSON.stringify(body);
    }
    return fetch(path, init).then(r => r.json());
  }

  function startCamera() {
    post('/start_camera', { detection: true }).then(data => {
      if (data.success) {
        running = true;
        detection = true;
        reloadVideo();
      } else {
        alert(data.status);
      }
      render();
    });
  }

  function stopCamera() {
    post('/stop_camera').then(data => {
      if (data.success) running = false;
      render();
    });
  }

  function toggleDetection() {
    post('/toggle_detection').then(data => {
      if (data.success) detection = data.detection_enabled;
      render();
    });
  }

  function poll() {
    fetch('/status').then(r => r.json()).then(data => {
      const wasRunning = running;
      running = data.camera_running;
      detection = data.detection_enabled;
      if (running && !wasRunning) reloadVideo();
      render();
    }).catch(() => {});
  }

  window.onload = function () {
    document.getElementById('video').onerror = function () {
      if (running) setTimeout(reloadVideo, 2000);
    };
    poll();
    setInterval(poll, 2000);
  };
</script>
</body>
</html>
"#;

/// Render the control page for a server reachable at `address` (`ip:port`).
pub fn render_index(address: &str) -> String {
    INDEX_TEMPLATE.replace("{{ADDRESS}}", &escape_html(address))
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
